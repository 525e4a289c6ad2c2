use std::collections::HashSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Shared signing-key source for capability tokens. The gateway never issues
/// tokens; it only verifies tokens minted by the external signing authority
/// with the same key and issuer.
#[derive(Debug, Clone)]
pub struct KeySource {
    key: Vec<u8>,
    issuer: String,
}

impl KeySource {
    pub fn new(key: Vec<u8>, issuer: impl Into<String>) -> Self {
        Self {
            key,
            issuer: issuer.into(),
        }
    }

    pub fn from_base64(encoded: &str, issuer: impl Into<String>) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::invalid_token(format!("Invalid signing key encoding: {}", e)))?;
        Ok(Self::new(key, issuer))
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub(crate) fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length; new_from_slice only fails for
        // zero-capacity buffers, which Vec never produces.
        HmacSha256::new_from_slice(&self.key).expect("HMAC key of any length is valid")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Llm,
    Embedding,
    VectorStorage,
    Admin,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Llm => "llm",
            Resource::Embedding => "embedding",
            Resource::VectorStorage => "vector_storage",
            Resource::Admin => "admin",
        }
    }
}

/// One per-request limit carried inside a capability. Unknown constraint
/// keys in a token are dropped at parse time; absence of a kind means the
/// capability is unconstrained in that dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    MaxTokens(u32),
    AllowedModels(HashSet<String>),
    RequestsPerMinute(u32),
}

/// One resource-scoped permission inside a token.
#[derive(Debug, Clone)]
pub struct Capability {
    pub resource: Resource,
    pub actions: HashSet<String>,
    pub constraints: Vec<Constraint>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Capability {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now > exp).unwrap_or(false)
    }

    pub fn allows_action(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::MaxTokens(n) => Some(*n),
            _ => None,
        })
    }

    pub fn allowed_models(&self) -> Option<&HashSet<String>> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::AllowedModels(set) => Some(set),
            _ => None,
        })
    }

    pub fn requests_per_minute(&self) -> Option<u32> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::RequestsPerMinute(n) => Some(*n),
            _ => None,
        })
    }

    /// Stable digest used to key rate-limit windows per (tenant, capability).
    pub fn fingerprint(&self) -> String {
        let mut actions: Vec<&str> = self.actions.iter().map(String::as_str).collect();
        actions.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.resource.as_str().as_bytes());
        for action in actions {
            hasher.update(b"|");
            hasher.update(action.as_bytes());
        }
        if let Some(limit) = self.requests_per_minute() {
            hasher.update(format!("|rpm={}", limit).as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// A verified, signed grant for one (user, tenant) pair.
#[derive(Debug, Clone)]
pub struct CapabilityToken {
    pub subject: String,
    pub tenant_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub capabilities: Vec<Capability>,
}

impl CapabilityToken {
    /// First non-expired capability matching the resource.
    pub fn capability_for(&self, resource: Resource, now: DateTime<Utc>) -> Option<&Capability> {
        self.capabilities
            .iter()
            .find(|cap| cap.resource == resource && !cap.is_expired(now))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawClaims {
    pub sub: String,
    pub tenant_id: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    #[serde(default)]
    pub capabilities: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawCapability {
    resource: Resource,
    actions: HashSet<String>,
    #[serde(default)]
    constraints: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Decode the claims segment and check the HMAC tag. Claim-level policy
/// (issuer, expiry) is enforced by the verifier.
pub(crate) fn decode_signed(raw: &str, keys: &KeySource) -> Result<RawClaims> {
    let (payload_b64, sig_b64) = raw
        .split_once('.')
        .ok_or_else(|| Error::invalid_token("Token is not in payload.signature form"))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| Error::invalid_token("Token payload is not valid base64url"))?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| Error::invalid_token("Token signature is not valid base64url"))?;

    let mut mac = keys.mac();
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| Error::invalid_token("Signature verification failed"))?;

    serde_json::from_slice(&payload)
        .map_err(|e| Error::invalid_token(format!("Malformed claims: {}", e)))
}

/// Sign a claims payload into wire form. The production issuer lives outside
/// the gateway; this exists so embedding applications and tests can mint
/// tokens against a local key.
pub fn sign_claims(claims: &serde_json::Value, keys: &KeySource) -> Result<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let mut mac = keys.mac();
    mac.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", payload, signature))
}

/// Parse one capability entry. Returns None (with a warning) on malformed
/// entries so a token degrades to its remaining valid capabilities instead
/// of being rejected outright.
pub(crate) fn parse_capability(value: &serde_json::Value) -> Option<Capability> {
    let raw: RawCapability = match serde_json::from_value(value.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Skipping malformed capability entry: {}", e);
            return None;
        }
    };

    let mut constraints = Vec::new();
    for (key, val) in &raw.constraints {
        match key.as_str() {
            "max_tokens" => match val.as_u64() {
                Some(n) => constraints.push(Constraint::MaxTokens(n as u32)),
                None => {
                    warn!("Skipping malformed capability entry: max_tokens is not an integer");
                    return None;
                }
            },
            "allowed_models" => match val.as_array() {
                Some(items) => {
                    let models: Option<HashSet<String>> = items
                        .iter()
                        .map(|m| m.as_str().map(str::to_string))
                        .collect();
                    match models {
                        Some(set) => constraints.push(Constraint::AllowedModels(set)),
                        None => {
                            warn!("Skipping malformed capability entry: allowed_models contains a non-string");
                            return None;
                        }
                    }
                }
                None => {
                    warn!("Skipping malformed capability entry: allowed_models is not an array");
                    return None;
                }
            },
            "requests_per_minute" => match val.as_u64() {
                Some(n) => constraints.push(Constraint::RequestsPerMinute(n as u32)),
                None => {
                    warn!("Skipping malformed capability entry: requests_per_minute is not an integer");
                    return None;
                }
            },
            other => {
                // Forward compatibility: unknown constraint kinds are ignored.
                warn!("Ignoring unknown constraint kind '{}'", other);
            }
        }
    }

    Some(Capability {
        resource: raw.resource,
        actions: raw.actions,
        constraints,
        expires_at: raw.expires_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys() -> KeySource {
        KeySource::new(b"test-signing-key".to_vec(), "control-plane")
    }

    #[test]
    fn test_sign_and_decode_round_trip() {
        let claims = json!({
            "sub": "user-1",
            "tenant_id": "t1",
            "iat": 1_700_000_000,
            "exp": 1_900_000_000,
            "iss": "control-plane",
            "capabilities": [],
        });
        let raw = sign_claims(&claims, &keys()).unwrap();
        let decoded = decode_signed(&raw, &keys()).unwrap();
        assert_eq!(decoded.sub, "user-1");
        assert_eq!(decoded.tenant_id, "t1");
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let claims = json!({
            "sub": "user-1",
            "tenant_id": "t1",
            "iat": 0,
            "exp": 1_900_000_000,
            "iss": "control-plane",
        });
        let raw = sign_claims(&claims, &keys()).unwrap();
        let (_, sig) = raw.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "sub": "user-1",
                "tenant_id": "t2",
                "iat": 0,
                "exp": 1_900_000_000,
                "iss": "control-plane",
            }))
            .unwrap(),
        );
        let forged = format!("{}.{}", forged_payload, sig);
        assert!(matches!(
            decode_signed(&forged, &keys()),
            Err(Error::InvalidToken(_))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let claims = json!({
            "sub": "u", "tenant_id": "t", "iat": 0, "exp": 1, "iss": "control-plane",
        });
        let raw = sign_claims(&claims, &keys()).unwrap();
        let other = KeySource::new(b"other-key".to_vec(), "control-plane");
        assert!(decode_signed(&raw, &other).is_err());
    }

    #[test]
    fn test_parse_capability_with_constraints() {
        let cap = parse_capability(&json!({
            "resource": "llm",
            "actions": ["execute"],
            "constraints": {
                "max_tokens": 4000,
                "allowed_models": ["m1", "m2"],
                "requests_per_minute": 60,
            },
        }))
        .unwrap();
        assert_eq!(cap.resource, Resource::Llm);
        assert_eq!(cap.max_tokens(), Some(4000));
        assert!(cap.allowed_models().unwrap().contains("m1"));
        assert_eq!(cap.requests_per_minute(), Some(60));
    }

    #[test]
    fn test_parse_capability_malformed_returns_none() {
        assert!(parse_capability(&json!({"actions": ["execute"]})).is_none());
        assert!(parse_capability(&json!({
            "resource": "llm",
            "actions": ["execute"],
            "constraints": {"max_tokens": "lots"},
        }))
        .is_none());
    }

    #[test]
    fn test_unknown_constraint_ignored() {
        let cap = parse_capability(&json!({
            "resource": "embedding",
            "actions": ["execute"],
            "constraints": {"gpu_class": "a100"},
        }))
        .unwrap();
        assert!(cap.constraints.is_empty());
    }

    #[test]
    fn test_fingerprint_stable_across_action_order() {
        let a = parse_capability(&json!({
            "resource": "llm",
            "actions": ["execute", "list"],
        }))
        .unwrap();
        let b = parse_capability(&json!({
            "resource": "llm",
            "actions": ["list", "execute"],
        }))
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}

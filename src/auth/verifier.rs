use chrono::{TimeZone, Utc};
use tracing::{debug, warn};

use crate::auth::token::{
    decode_signed, parse_capability, CapabilityToken, KeySource, Resource,
};
use crate::error::{Error, Result};

/// Per-request values checked against the stored capability constraints.
/// Absence of a constraint kind in the capability means unconstrained.
#[derive(Debug, Clone)]
pub enum AdmissionCheck {
    RequestedModel(String),
    RequestedMaxTokens(u32),
}

/// Decodes capability tokens and answers admission questions. Pure with
/// respect to the request; rate-limit bookkeeping lives in
/// [`crate::auth::rate_limit::RateWindowLimiter`].
#[derive(Debug, Clone)]
pub struct CapabilityVerifier {
    keys: KeySource,
}

impl CapabilityVerifier {
    pub fn new(keys: KeySource) -> Self {
        Self { keys }
    }

    /// Decode and cryptographically validate a raw token. Individual
    /// malformed capability entries are skipped, not fatal; the token stays
    /// usable with its remaining valid capabilities.
    pub fn verify(&self, raw: &str) -> Result<CapabilityToken> {
        let claims = decode_signed(raw, &self.keys)?;

        if claims.iss != self.keys.issuer() {
            return Err(Error::invalid_token(format!(
                "Unexpected issuer '{}'",
                claims.iss
            )));
        }

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| Error::invalid_token("exp claim out of range"))?;
        let issued_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or_else(|| Error::invalid_token("iat claim out of range"))?;

        if Utc::now() > expires_at {
            return Err(Error::ExpiredToken);
        }
        if claims.sub.is_empty() || claims.tenant_id.is_empty() {
            return Err(Error::invalid_token("Missing subject or tenant claim"));
        }

        let total = claims.capabilities.len();
        let capabilities: Vec<_> = claims
            .capabilities
            .iter()
            .filter_map(parse_capability)
            .collect();
        if capabilities.len() < total {
            warn!(
                "Token for subject '{}' carried {} malformed capability entries",
                claims.sub,
                total - capabilities.len()
            );
        }

        Ok(CapabilityToken {
            subject: claims.sub,
            tenant_id: claims.tenant_id,
            issued_at,
            expires_at,
            issuer: claims.iss,
            capabilities,
        })
    }

    /// Decide whether (tenant, resource, action) may proceed under the given
    /// token, validating each supplied per-request check against the stored
    /// constraints.
    pub fn admit(
        &self,
        token: &CapabilityToken,
        tenant_id: &str,
        resource: Resource,
        action: &str,
        checks: &[AdmissionCheck],
    ) -> Result<()> {
        if token.tenant_id != tenant_id {
            return Err(Error::invalid_token(format!(
                "Token issued for tenant '{}', not '{}'",
                token.tenant_id, tenant_id
            )));
        }

        let now = Utc::now();
        let capability = token.capability_for(resource, now).ok_or_else(|| {
            Error::NoCapability {
                resource: resource.as_str().to_string(),
            }
        })?;

        if !capability.allows_action(action) {
            return Err(Error::ActionNotAllowed {
                resource: resource.as_str().to_string(),
                action: action.to_string(),
            });
        }

        for check in checks {
            match check {
                AdmissionCheck::RequestedModel(model) => {
                    if let Some(allowed) = capability.allowed_models() {
                        if !allowed.contains(model) {
                            return Err(Error::constraint_violation(format!(
                                "Model '{}' is not in the allowed set",
                                model
                            )));
                        }
                    }
                }
                AdmissionCheck::RequestedMaxTokens(requested) => {
                    if let Some(ceiling) = capability.max_tokens() {
                        if *requested > ceiling {
                            return Err(Error::constraint_violation(format!(
                                "Requested {} tokens exceeds the {} token ceiling",
                                requested, ceiling
                            )));
                        }
                    }
                }
            }
        }

        debug!(
            "Admitted subject '{}' for {}:{} on tenant '{}'",
            token.subject,
            resource.as_str(),
            action,
            tenant_id
        );
        Ok(())
    }
}

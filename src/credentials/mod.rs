use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Resolves the API key a tenant uses for a given provider. There is never
/// an environment-variable fallback: a tenant without a configured key is a
/// hard per-tenant failure.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn api_key(&self, tenant_domain: &str, provider: &str) -> Result<String>;
}

/// Config-backed key map. Encrypted storage is an external concern; the
/// embedding application can supply its own resolver over a vault.
#[derive(Default)]
pub struct StaticCredentials {
    keys: RwLock<HashMap<(String, String), String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: HashMap<(String, String), String>) -> Self {
        Self {
            keys: RwLock::new(entries),
        }
    }

    pub fn set_key(
        &self,
        tenant_domain: impl Into<String>,
        provider: impl Into<String>,
        key: impl Into<String>,
    ) {
        self.keys
            .write()
            .insert((tenant_domain.into(), provider.into()), key.into());
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn api_key(&self, tenant_domain: &str, provider: &str) -> Result<String> {
        self.keys
            .read()
            .get(&(tenant_domain.to_string(), provider.to_string()))
            .cloned()
            .ok_or_else(|| Error::ApiKeyNotConfigured {
                tenant_domain: tenant_domain.to_string(),
                provider: provider.to_string(),
            })
    }
}

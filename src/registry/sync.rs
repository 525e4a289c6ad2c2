use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::registry::catalog::{CatalogSnapshot, ModelConfig, ModelRegistry, TenantModelGrant};

/// Source of catalog data. The production implementation pulls from the
/// control-plane HTTP API; tests substitute a stub.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn fetch_models(&self) -> Result<Vec<ModelConfig>>;
    async fn fetch_grants(&self) -> Result<Vec<GrantRecord>>;
}

/// Wire row from `GET /tenant-models/tenants/all`.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantRecord {
    pub tenant_domain: String,
    pub tenant_id: String,
    pub model_id: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl GrantRecord {
    fn into_grant(self) -> TenantModelGrant {
        TenantModelGrant {
            tenant_id: self.tenant_id,
            model_id: self.model_id,
            is_enabled: self.is_enabled,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Control-plane pull API over HTTP with a bounded per-request timeout.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::internal(format!(
                "Control plane returned {} for {}",
                response.status(),
                path
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlane {
    async fn fetch_models(&self) -> Result<Vec<ModelConfig>> {
        self.get_json("/models?active_only=true").await
    }

    async fn fetch_grants(&self) -> Result<Vec<GrantRecord>> {
        self.get_json("/tenant-models/tenants/all").await
    }
}

/// Periodically refreshes the registry from the control plane. A sync in
/// progress suppresses concurrent syncs; any failure leaves the previous
/// snapshot serving.
pub struct ConfigSyncWorker {
    registry: Arc<ModelRegistry>,
    source: Arc<dyn ControlPlaneClient>,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl ConfigSyncWorker {
    pub fn new(
        registry: Arc<ModelRegistry>,
        source: Arc<dyn ControlPlaneClient>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            source,
            interval,
            in_flight: Mutex::new(()),
        }
    }

    /// One refresh attempt, single-flight. Returns Ok(false) when another
    /// sync already holds the guard.
    pub async fn sync(&self) -> Result<bool> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Sync already in progress, skipping");
            return Ok(false);
        };

        let models = self.source.fetch_models().await?;
        if models.is_empty() {
            // An empty catalog is indistinguishable from a control-plane
            // fault; keep serving the last known-good snapshot.
            warn!("Control plane returned an empty model list, keeping prior snapshot");
            return Err(Error::internal("Empty model payload from control plane"));
        }
        let grants = self.source.fetch_grants().await?;

        let grant_count = grants.len();
        let snapshot = CatalogSnapshot::build(
            models,
            grants.into_iter().map(GrantRecord::into_grant).collect(),
        );
        self.registry.install(snapshot);
        debug!("Sync applied with {} grant rows", grant_count);
        Ok(true)
    }

    /// Admin-triggered refresh that bypasses the interval.
    pub async fn force_sync(&self) -> Result<bool> {
        info!("Forced catalog sync requested");
        self.sync().await
    }

    /// Run the refresh loop forever. Fetch failures are logged and retried
    /// on the next tick, never surfaced past this boundary.
    pub async fn run(self: Arc<Self>) {
        // Jitter keeps a fleet of gateways from stampeding the control plane.
        let jitter = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(0..=self.interval.as_millis().min(5_000) as u64))
        };
        tokio::time::sleep(jitter).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sync().await {
                Ok(true) => {}
                Ok(false) => debug!("Tick skipped, sync already running"),
                Err(e) => error!("Catalog sync failed, serving stale snapshot: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog::test_support::model;
    use parking_lot::Mutex as PlMutex;

    struct StubControlPlane {
        models: PlMutex<Result<Vec<ModelConfig>>>,
        grants: PlMutex<Result<Vec<GrantRecord>>>,
    }

    impl StubControlPlane {
        fn new(models: Vec<ModelConfig>, grants: Vec<GrantRecord>) -> Self {
            Self {
                models: PlMutex::new(Ok(models)),
                grants: PlMutex::new(Ok(grants)),
            }
        }

        fn fail_models(&self) {
            *self.models.lock() = Err(Error::internal("control plane down"));
        }

        fn set_models(&self, models: Vec<ModelConfig>) {
            *self.models.lock() = Ok(models);
        }
    }

    #[async_trait]
    impl ControlPlaneClient for StubControlPlane {
        async fn fetch_models(&self) -> Result<Vec<ModelConfig>> {
            match &*self.models.lock() {
                Ok(models) => Ok(models.clone()),
                Err(_) => Err(Error::internal("control plane down")),
            }
        }

        async fn fetch_grants(&self) -> Result<Vec<GrantRecord>> {
            match &*self.grants.lock() {
                Ok(grants) => Ok(grants.clone()),
                Err(_) => Err(Error::internal("control plane down")),
            }
        }
    }

    fn grant_record(tenant: &str, model_id: &str) -> GrantRecord {
        GrantRecord {
            tenant_domain: format!("{}.example.com", tenant),
            tenant_id: tenant.to_string(),
            model_id: model_id.to_string(),
            is_enabled: true,
            max_tokens: None,
            temperature: None,
        }
    }

    #[tokio::test]
    async fn test_successful_sync_installs_snapshot() {
        let registry = Arc::new(ModelRegistry::new());
        let source = Arc::new(StubControlPlane::new(
            vec![model("m1", "groq", true)],
            vec![grant_record("t1", "m1")],
        ));
        let worker = ConfigSyncWorker::new(
            Arc::clone(&registry),
            source,
            Duration::from_secs(60),
        );

        assert!(worker.sync().await.unwrap());
        assert!(registry.get_model("m1").is_some());
        assert!(registry.tenant_can_access("t1", "m1"));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_prior_snapshot() {
        let registry = Arc::new(ModelRegistry::new());
        let source = Arc::new(StubControlPlane::new(
            vec![model("m1", "groq", true)],
            vec![grant_record("t1", "m1")],
        ));
        let worker = ConfigSyncWorker::new(
            Arc::clone(&registry),
            Arc::clone(&source) as Arc<dyn ControlPlaneClient>,
            Duration::from_secs(60),
        );

        worker.sync().await.unwrap();
        assert!(registry.get_model("m1").is_some());

        source.fail_models();
        assert!(worker.sync().await.is_err());
        // Prior snapshot still serving.
        assert!(registry.get_model("m1").is_some());
        assert!(registry.tenant_can_access("t1", "m1"));
    }

    #[tokio::test]
    async fn test_empty_payload_never_replaces_snapshot() {
        let registry = Arc::new(ModelRegistry::new());
        let source = Arc::new(StubControlPlane::new(
            vec![model("m1", "groq", true)],
            vec![grant_record("t1", "m1")],
        ));
        let worker = ConfigSyncWorker::new(
            Arc::clone(&registry),
            Arc::clone(&source) as Arc<dyn ControlPlaneClient>,
            Duration::from_secs(60),
        );

        worker.sync().await.unwrap();
        source.set_models(vec![]);
        assert!(worker.sync().await.is_err());
        assert!(registry.get_model("m1").is_some());
    }

    #[tokio::test]
    async fn test_force_sync_applies_new_models() {
        let registry = Arc::new(ModelRegistry::new());
        let source = Arc::new(StubControlPlane::new(
            vec![model("m1", "groq", true)],
            vec![],
        ));
        let worker = ConfigSyncWorker::new(
            Arc::clone(&registry),
            Arc::clone(&source) as Arc<dyn ControlPlaneClient>,
            Duration::from_secs(3600),
        );

        worker.force_sync().await.unwrap();
        source.set_models(vec![model("m1", "groq", true), model("m2", "nim", true)]);
        worker.force_sync().await.unwrap();
        assert!(registry.get_model("m2").is_some());
    }
}

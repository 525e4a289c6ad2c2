pub mod config;

pub use config::{GatewayConfig, ProviderConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::{CapabilityVerifier, KeySource};
use crate::credentials::CredentialResolver;
use crate::dispatch::{DispatchOutcome, Dispatcher, InferenceRequest, UsageLogger, UsageSink};
use crate::error::Result;
use crate::providers::backend::HealthStatus;
use crate::providers::{ExternalBackend, GroqBackend, NimBackend, ProviderBackend};
use crate::registry::{ConfigSyncWorker, HttpControlPlane, ModelRegistry};

/// Fully wired gateway: verifier, registry, provider backends, sync worker,
/// and dispatcher. The embedding server owns the outer HTTP surface and
/// calls [`Gateway::dispatch`] per request.
pub struct Gateway {
    dispatcher: Dispatcher,
    registry: Arc<ModelRegistry>,
    sync_worker: Arc<ConfigSyncWorker>,
    backends: HashMap<String, Arc<dyn ProviderBackend>>,
    usage_handle: JoinHandle<()>,
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        credentials: Arc<dyn CredentialResolver>,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Result<Self> {
        let keys = KeySource::from_base64(&config.auth.signing_key, &config.auth.issuer)?;
        let verifier = CapabilityVerifier::new(keys);

        let registry = Arc::new(ModelRegistry::new());
        let backends = Self::build_backends(config)?;

        // Backends learn about endpoint moves through the registry's
        // subscription hook rather than holding a registry reference.
        {
            let weak = Arc::downgrade(&registry);
            let backends = backends.clone();
            registry.subscribe(move |model_id, endpoints| {
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                if let Some(model) = registry.get_model(model_id) {
                    if let Some(backend) = backends.get(&model.provider) {
                        backend.on_config_updated(model_id, endpoints);
                    }
                }
            });
        }

        let control_plane = HttpControlPlane::new(
            &config.control_plane.base_url,
            Duration::from_secs(config.control_plane.request_timeout_seconds),
        )?;
        let sync_worker = Arc::new(ConfigSyncWorker::new(
            Arc::clone(&registry),
            Arc::new(control_plane),
            config.sync_interval(),
        ));

        let (usage, usage_handle) = UsageLogger::spawn(usage_sink, config.usage.queue_size);

        let dispatcher = Dispatcher::new(
            verifier,
            Arc::clone(&registry),
            backends.clone(),
            credentials,
            usage,
            config.auth.default_requests_per_minute,
        );

        info!(
            "Gateway wired with {} provider backends, syncing from {}",
            backends.len(),
            config.control_plane.base_url
        );

        Ok(Self {
            dispatcher,
            registry,
            sync_worker,
            backends,
            usage_handle,
        })
    }

    fn build_backends(config: &GatewayConfig) -> Result<HashMap<String, Arc<dyn ProviderBackend>>> {
        let mut backends: HashMap<String, Arc<dyn ProviderBackend>> = HashMap::new();

        let p = &config.providers.groq;
        if p.enabled {
            backends.insert(
                crate::providers::groq::PROVIDER_NAME.to_string(),
                Arc::new(GroqBackend::new(p.endpoints.clone(), Some(p.timeout()))?),
            );
        }
        let p = &config.providers.nim;
        if p.enabled {
            backends.insert(
                crate::providers::nim::PROVIDER_NAME.to_string(),
                Arc::new(NimBackend::new(p.endpoints.clone(), Some(p.timeout()))?),
            );
        }
        let p = &config.providers.bge;
        if p.enabled {
            backends.insert(
                crate::providers::bge::PROVIDER_NAME.to_string(),
                Arc::new(ExternalBackend::new(p.endpoints.clone(), Some(p.timeout()))?),
            );
        }

        Ok(backends)
    }

    pub async fn dispatch(&self, request: InferenceRequest) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(request).await
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn has_backend(&self, provider: &str) -> bool {
        self.backends.contains_key(provider)
    }

    /// Spawn the background catalog refresh loop.
    pub fn start_sync(&self) -> JoinHandle<()> {
        let worker = Arc::clone(&self.sync_worker);
        tokio::spawn(worker.run())
    }

    /// Admin-triggered catalog refresh, bypassing the sync interval.
    pub async fn force_sync(&self) -> Result<bool> {
        self.sync_worker.force_sync().await
    }

    pub async fn health(&self) -> HashMap<String, HealthStatus> {
        let mut out = HashMap::new();
        for (provider, backend) in &self.backends {
            out.insert(provider.clone(), backend.health_check().await);
        }
        out
    }

    /// Stop accepting usage records and wait for the queue to drain.
    pub async fn shutdown(self) {
        let Self {
            dispatcher,
            usage_handle,
            ..
        } = self;
        drop(dispatcher);
        let _ = usage_handle.await;
        info!("Gateway shut down, usage queue drained");
    }
}

/// Log initialization for binaries embedding the gateway. Library code only
/// emits tracing events and never installs a subscriber itself.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelgate=info".parse().unwrap()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::dispatch::MemorySink;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.auth.signing_key = STANDARD.encode(b"gateway-test-key");
        config
    }

    fn gateway(config: &GatewayConfig) -> Gateway {
        Gateway::new(
            config,
            Arc::new(StaticCredentials::new()),
            Arc::new(MemorySink::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_enabled_backends_registered() {
        let gw = gateway(&config());
        assert!(gw.has_backend("groq"));
        assert!(gw.has_backend("nim"));
        assert!(gw.has_backend("external"));
    }

    #[tokio::test]
    async fn test_disabled_provider_not_registered() {
        let mut config = config();
        config.providers.nim.enabled = false;
        let gw = gateway(&config);
        assert!(gw.has_backend("groq"));
        assert!(!gw.has_backend("nim"));
    }

    #[tokio::test]
    async fn test_endpoint_update_routed_to_backend() {
        use crate::registry::catalog::test_support::{grant, model};
        use crate::registry::CatalogSnapshot;

        let gw = gateway(&config());
        let mut m = model("m1", "groq", true);
        m.endpoints = vec!["https://groq-b.example.com".into()];
        // Install must not panic while the subscription closure runs; the
        // groq pool picks up the new endpoint list.
        gw.registry()
            .install(CatalogSnapshot::build(vec![m], vec![grant("t1", "m1", true)]));
    }

    #[tokio::test]
    async fn test_bad_signing_key_rejected() {
        let mut config = GatewayConfig::default();
        config.auth.signing_key = "not base64!!!".into();
        assert!(Gateway::new(
            &config,
            Arc::new(StaticCredentials::new()),
            Arc::new(MemorySink::new()),
        )
        .is_err());
    }
}

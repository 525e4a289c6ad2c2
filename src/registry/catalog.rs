use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Chat,
    Embedding,
}

/// One routable model as published by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub uuid: Uuid,
    pub provider: String,
    pub model_type: ModelType,
    pub endpoints: Vec<String>,
    pub context_window: u32,
    pub max_tokens: u32,
    pub cost_per_1k_input: Decimal,
    pub cost_per_1k_output: Decimal,
    pub is_active: bool,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Tenant-to-model allow-list entry, with optional per-tenant parameter
/// overrides that sit between model defaults and request values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantModelGrant {
    pub tenant_id: String,
    pub model_id: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Immutable view of the model catalog and tenant grants. Replaced wholesale
/// on each successful sync; readers never observe a partial update.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    by_model_id: HashMap<String, Arc<ModelConfig>>,
    by_uuid: HashMap<Uuid, Arc<ModelConfig>>,
    tenant_grants: HashMap<String, HashMap<String, TenantModelGrant>>,
}

impl CatalogSnapshot {
    pub fn build(models: Vec<ModelConfig>, grants: Vec<TenantModelGrant>) -> Self {
        let mut by_model_id: HashMap<String, Arc<ModelConfig>> = HashMap::new();
        let mut by_uuid = HashMap::new();

        for mut model in models {
            if model.cost_per_1k_input < Decimal::ZERO || model.cost_per_1k_output < Decimal::ZERO {
                warn!(
                    "Dropping model '{}' with negative cost fields",
                    model.model_id
                );
                continue;
            }
            model.endpoints.retain(|endpoint| {
                let ok = url::Url::parse(endpoint).is_ok();
                if !ok {
                    warn!(
                        "Dropping unparseable endpoint '{}' for model '{}'",
                        endpoint, model.model_id
                    );
                }
                ok
            });
            let model = Arc::new(model);
            by_uuid.insert(model.uuid, Arc::clone(&model));
            let existing_active = by_model_id.get(&model.model_id).map(|m| m.is_active);
            match existing_active {
                Some(true) => {
                    if model.is_active {
                        warn!(
                            "Duplicate active model id '{}' in control-plane payload, keeping first",
                            model.model_id
                        );
                    }
                }
                // An active row supersedes an earlier inactive one.
                Some(false) if model.is_active => {
                    by_model_id.insert(model.model_id.clone(), model);
                }
                Some(false) => {}
                None => {
                    by_model_id.insert(model.model_id.clone(), model);
                }
            }
        }

        let mut tenant_grants: HashMap<String, HashMap<String, TenantModelGrant>> = HashMap::new();
        for grant in grants {
            tenant_grants
                .entry(grant.tenant_id.clone())
                .or_default()
                .insert(grant.model_id.clone(), grant);
        }

        Self {
            by_model_id,
            by_uuid,
            tenant_grants,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_model_id.is_empty()
    }

    fn grants_for(&self, tenant_id: &str) -> Option<&HashMap<String, TenantModelGrant>> {
        if let Some(grants) = self.tenant_grants.get(tenant_id) {
            return Some(grants);
        }

        // Compatibility fallbacks for non-canonical tenant identifiers.
        // Known-heuristic behavior: a domain-qualified key is tried with its
        // suffix stripped, then a numeric id is matched on digits alone.
        if let Some((short, _)) = tenant_id.split_once('.') {
            if let Some(grants) = self.tenant_grants.get(short) {
                debug!(
                    "Tenant '{}' resolved via domain-prefix fallback '{}'",
                    tenant_id, short
                );
                return Some(grants);
            }
        }

        let digits: String = tenant_id.chars().filter(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            for (key, grants) in &self.tenant_grants {
                let key_digits: String = key.chars().filter(char::is_ascii_digit).collect();
                if !key_digits.is_empty() && key_digits == digits {
                    debug!(
                        "Tenant '{}' resolved via numeric fallback to '{}'",
                        tenant_id, key
                    );
                    return Some(grants);
                }
            }
        }

        None
    }
}

type EndpointListener = Box<dyn Fn(&str, &[String]) + Send + Sync>;

/// Read-mostly cache of models and tenant grants. Reads are lock-free loads
/// of the current snapshot; `install` swaps in a fresh snapshot and notifies
/// endpoint-change subscribers.
pub struct ModelRegistry {
    snapshot: ArcSwap<CatalogSnapshot>,
    listeners: RwLock<Vec<EndpointListener>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn get_model(&self, model_id: &str) -> Option<Arc<ModelConfig>> {
        self.snapshot.load().by_model_id.get(model_id).cloned()
    }

    pub fn get_model_by_uuid(&self, uuid: &Uuid) -> Option<Arc<ModelConfig>> {
        self.snapshot.load().by_uuid.get(uuid).cloned()
    }

    pub fn list_active(&self) -> Vec<Arc<ModelConfig>> {
        self.snapshot
            .load()
            .by_model_id
            .values()
            .filter(|m| m.is_active)
            .cloned()
            .collect()
    }

    /// True only when the model is in the tenant's enabled grant set and
    /// globally active. A globally disabled model is inaccessible even when
    /// previously granted.
    pub fn tenant_can_access(&self, tenant_id: &str, model_id: &str) -> bool {
        let snapshot = self.snapshot.load();
        let Some(model) = snapshot.by_model_id.get(model_id) else {
            return false;
        };
        if !model.is_active {
            return false;
        }
        snapshot
            .grants_for(tenant_id)
            .and_then(|grants| grants.get(model_id))
            .map(|grant| grant.is_enabled)
            .unwrap_or(false)
    }

    pub fn grant(&self, tenant_id: &str, model_id: &str) -> Option<TenantModelGrant> {
        self.snapshot
            .load()
            .grants_for(tenant_id)
            .and_then(|grants| grants.get(model_id))
            .cloned()
    }

    /// Register a callback fired with (model_id, new endpoint list) whenever
    /// a sync changes a model's endpoints. This is how provider backends
    /// learn about endpoint moves without holding a registry reference.
    pub fn subscribe(&self, listener: impl Fn(&str, &[String]) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Swap in a new snapshot and notify subscribers of endpoint changes.
    pub fn install(&self, next: CatalogSnapshot) {
        let previous = self.snapshot.load_full();

        let mut changed: Vec<(String, Vec<String>)> = Vec::new();
        for (model_id, model) in &next.by_model_id {
            let prior = previous.by_model_id.get(model_id);
            if prior.map(|p| &p.endpoints) != Some(&model.endpoints) {
                changed.push((model_id.clone(), model.endpoints.clone()));
            }
        }

        let model_count = next.by_model_id.len();
        let tenant_count = next.tenant_grants.len();
        self.snapshot.store(Arc::new(next));
        info!(
            "Installed catalog snapshot: {} models, {} tenants, {} endpoint changes",
            model_count,
            tenant_count,
            changed.len()
        );

        if !changed.is_empty() {
            let listeners = self.listeners.read();
            for (model_id, endpoints) in &changed {
                for listener in listeners.iter() {
                    listener(model_id, endpoints);
                }
            }
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

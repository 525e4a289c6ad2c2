pub mod usage;

pub use usage::{MemorySink, UsageLogger, UsageRecord, UsageSink, UsageStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AdmissionCheck, CapabilityVerifier, RateWindowLimiter, Resource};
use crate::credentials::CredentialResolver;
use crate::error::{Error, Result};
use crate::providers::backend::{
    ChatMessage, ChunkStream, InferenceResult, PreparedRequest, ProviderBackend,
};
use crate::providers::pricing;
use crate::registry::{ModelRegistry, ModelType};

pub const ACTION_EXECUTE: &str = "execute";

/// One dispatch unit, immutable once accepted.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Inputs for embedding models; an embedding request carries these
    /// instead of messages.
    pub inputs: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub tenant_id: String,
    pub tenant_domain: String,
    pub user_id: String,
    pub capability_token: String,
}

impl InferenceRequest {
    pub fn chat(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        tenant_id: impl Into<String>,
        tenant_domain: impl Into<String>,
        user_id: impl Into<String>,
        capability_token: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            model: model.into(),
            messages,
            inputs: vec![],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
            tenant_id: tenant_id.into(),
            tenant_domain: tenant_domain.into(),
            user_id: user_id.into(),
            capability_token: capability_token.into(),
        }
    }

    pub fn embedding(
        model: impl Into<String>,
        inputs: Vec<String>,
        tenant_id: impl Into<String>,
        tenant_domain: impl Into<String>,
        user_id: impl Into<String>,
        capability_token: impl Into<String>,
    ) -> Self {
        Self {
            inputs,
            ..Self::chat(model, vec![], tenant_id, tenant_domain, user_id, capability_token)
        }
    }

    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn resource(&self) -> Resource {
        if self.inputs.is_empty() {
            Resource::Llm
        } else {
            Resource::Embedding
        }
    }
}

pub enum DispatchOutcome {
    Completed(InferenceResult),
    Streaming(ChunkStream),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(result) => f.debug_tuple("Completed").field(result).finish(),
            // The chunk channel itself has nothing printable.
            Self::Streaming(stream) => {
                f.debug_tuple("Streaming").field(&stream.endpoint()).finish()
            }
        }
    }
}

/// Orchestrates one request end to end: ADMIT → RESOLVE → ROUTE → EXECUTE →
/// FINALIZE. The only component the outer API layer calls.
pub struct Dispatcher {
    verifier: CapabilityVerifier,
    limiter: RateWindowLimiter,
    registry: Arc<ModelRegistry>,
    backends: HashMap<String, Arc<dyn ProviderBackend>>,
    credentials: Arc<dyn CredentialResolver>,
    usage: UsageLogger,
    default_requests_per_minute: u32,
}

impl Dispatcher {
    pub fn new(
        verifier: CapabilityVerifier,
        registry: Arc<ModelRegistry>,
        backends: HashMap<String, Arc<dyn ProviderBackend>>,
        credentials: Arc<dyn CredentialResolver>,
        usage: UsageLogger,
        default_requests_per_minute: u32,
    ) -> Self {
        Self {
            verifier,
            limiter: RateWindowLimiter::new(),
            registry,
            backends,
            credentials,
            usage,
            default_requests_per_minute,
        }
    }

    pub fn backend(&self, provider: &str) -> Option<&Arc<dyn ProviderBackend>> {
        self.backends.get(provider)
    }

    pub async fn dispatch(&self, request: InferenceRequest) -> Result<DispatchOutcome> {
        // ADMIT: no provider work happens on any failure in this phase.
        let resource = request.resource();
        let token = self.verifier.verify(&request.capability_token)?;

        let mut checks = vec![AdmissionCheck::RequestedModel(request.model.clone())];
        if let Some(max_tokens) = request.max_tokens {
            checks.push(AdmissionCheck::RequestedMaxTokens(max_tokens));
        }
        self.verifier
            .admit(&token, &request.tenant_id, resource, ACTION_EXECUTE, &checks)?;

        if let Some(capability) = token.capability_for(resource, Utc::now()) {
            let limit = capability
                .requests_per_minute()
                .unwrap_or(self.default_requests_per_minute);
            self.limiter
                .check(&request.tenant_id, &capability.fingerprint(), limit)?;
        }

        // RESOLVE: a valid capability does not imply a tenant-model grant.
        let model = self
            .registry
            .get_model(&request.model)
            .ok_or_else(|| Error::ModelNotFound(request.model.clone()))?;
        if !model.is_active {
            return Err(Error::ModelUnavailable(request.model.clone()));
        }
        if !self
            .registry
            .tenant_can_access(&request.tenant_id, &request.model)
        {
            return Err(Error::AccessDenied {
                tenant_id: request.tenant_id.clone(),
                model_id: request.model.clone(),
            });
        }

        // The capability must cover the model's actual modality, not just
        // the request shape; padding `inputs` onto a chat request must not
        // route an llm call through an embedding capability.
        let effective = match model.model_type {
            ModelType::Chat => Resource::Llm,
            ModelType::Embedding => Resource::Embedding,
        };
        if effective != resource {
            self.verifier
                .admit(&token, &request.tenant_id, effective, ACTION_EXECUTE, &checks)?;
        }

        // ROUTE: merge configuration, model defaults < grant < request.
        let backend = self.backends.get(&model.provider).ok_or_else(|| {
            warn!("No backend registered for provider '{}'", model.provider);
            Error::ModelUnavailable(request.model.clone())
        })?;

        let grant = self.registry.grant(&request.tenant_id, &request.model);
        let max_tokens = request
            .max_tokens
            .or(grant.as_ref().and_then(|g| g.max_tokens))
            .or(Some(model.max_tokens));
        let temperature = request
            .temperature
            .or(grant.as_ref().and_then(|g| g.temperature));

        let api_key = self
            .credentials
            .api_key(&request.tenant_domain, &model.provider)
            .await?;

        let prepared = PreparedRequest {
            request_id: request.request_id.clone(),
            model_id: model.model_id.clone(),
            messages: request.messages.clone(),
            inputs: request.inputs.clone(),
            max_tokens,
            temperature,
            top_p: request.top_p,
            api_key,
            price_in_per_1k: model.cost_per_1k_input,
            price_out_per_1k: model.cost_per_1k_output,
        };

        debug!(
            "Routing request {} for tenant '{}' to provider '{}'",
            request.request_id, request.tenant_id, model.provider
        );

        // EXECUTE + FINALIZE.
        if request.stream {
            let stream = backend.infer_stream(&prepared).await?;
            Ok(DispatchOutcome::Streaming(
                self.wrap_stream(&request, &prepared, stream),
            ))
        } else {
            let started = Instant::now();
            let mut guard = CancelGuard::arm(self.usage.clone(), &request);
            let result = backend.infer(&prepared).await;
            guard.disarm();
            let result = result?;

            self.usage.submit(UsageRecord {
                id: Uuid::new_v4(),
                tenant_id: request.tenant_id.clone(),
                user_id: request.user_id.clone(),
                model_id: result.model_id.clone(),
                input_tokens: result.usage.input_tokens,
                output_tokens: result.usage.output_tokens,
                cost_cents: result.cost_cents,
                latency_ms: result.latency_ms,
                endpoint: result.endpoint.clone(),
                status: UsageStatus::Completed,
                timestamp: Utc::now(),
            });

            info!(
                "Request {} completed in {}ms ({} tokens, {}c)",
                request.request_id,
                started.elapsed().as_millis(),
                result.usage.total_tokens,
                result.cost_cents
            );
            Ok(DispatchOutcome::Completed(result))
        }
    }

    /// Forward chunks in generation order while accumulating usage, then
    /// emit exactly one record when the stream completes, fails mid-way, or
    /// the caller goes away.
    fn wrap_stream(
        &self,
        request: &InferenceRequest,
        prepared: &PreparedRequest,
        mut upstream: ChunkStream,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(32);
        let usage_logger = self.usage.clone();
        let tenant_id = request.tenant_id.clone();
        let user_id = request.user_id.clone();
        let model_id = prepared.model_id.clone();
        let endpoint = upstream.endpoint().to_string();
        let wrapped_endpoint = endpoint.clone();
        let price_in = prepared.price_in_per_1k;
        let price_out = prepared.price_out_per_1k;
        let input_estimate: u32 = prepared
            .messages
            .iter()
            .map(|m| pricing::estimate_tokens(&m.content))
            .sum();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut produced = String::new();
            let mut reported = None;
            let mut status = UsageStatus::Completed;

            loop {
                tokio::select! {
                    chunk = upstream.recv() => match chunk {
                        Some(Ok(chunk)) => {
                            produced.push_str(&chunk.delta);
                            if let Some(usage) = chunk.usage {
                                reported = Some(usage);
                            }
                            if tx.send(Ok(chunk)).await.is_err() {
                                status = UsageStatus::Cancelled;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            // Best-effort record for tokens already produced.
                            status = UsageStatus::Failed;
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                        None => break,
                    },
                    // Caller hung up; dropping `upstream` below aborts the
                    // provider read.
                    _ = tx.closed() => {
                        status = UsageStatus::Cancelled;
                        break;
                    }
                }
            }
            drop(upstream);

            let usage = reported.unwrap_or_else(|| {
                crate::providers::TokenUsage::new(
                    input_estimate,
                    pricing::estimate_tokens(&produced),
                )
            });
            usage_logger.submit(UsageRecord {
                id: Uuid::new_v4(),
                tenant_id,
                user_id,
                model_id,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost_cents: pricing::cost_cents(&usage, price_in, price_out),
                latency_ms: started.elapsed().as_millis() as u64,
                endpoint,
                status,
                timestamp: Utc::now(),
            });
        });

        ChunkStream::new(wrapped_endpoint, rx)
    }
}

/// Emits a `cancelled` usage record if a non-streaming dispatch future is
/// dropped while the provider call is in flight. Disarmed on both normal
/// return paths so completed and failed requests never double-report.
struct CancelGuard {
    logger: UsageLogger,
    record: Option<UsageRecord>,
}

impl CancelGuard {
    fn arm(logger: UsageLogger, request: &InferenceRequest) -> Self {
        Self {
            logger,
            record: Some(UsageRecord {
                id: Uuid::new_v4(),
                tenant_id: request.tenant_id.clone(),
                user_id: request.user_id.clone(),
                model_id: request.model.clone(),
                input_tokens: 0,
                output_tokens: 0,
                cost_cents: 0,
                latency_ms: 0,
                endpoint: String::new(),
                status: UsageStatus::Cancelled,
                timestamp: Utc::now(),
            }),
        }
    }

    fn disarm(&mut self) {
        self.record = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            debug!(
                "Request for tenant '{}' cancelled mid-flight",
                record.tenant_id
            );
            self.logger.submit(record);
        }
    }
}

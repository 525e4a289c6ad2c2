use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::providers::backend::{
    classify_status, retry_after_secs, ChunkStream, HealthStatus, HttpOutcome, InferenceResult,
    PreparedRequest, ProviderBackend, ResultContent, TokenUsage,
};
use crate::providers::endpoint_pool::EndpointPool;
use crate::providers::openai_wire::{auth_headers, build_request, spawn_sse_forwarder, WireResponse};
use crate::providers::pricing::{self, PriceTable};

pub const PROVIDER_NAME: &str = "groq";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Groq adapter: OpenAI-style chat completions over a multi-endpoint pool
/// with exponential per-endpoint backoff.
pub struct GroqBackend {
    client: Client,
    pool: EndpointPool,
    prices: PriceTable,
    timeout: Duration,
}

impl GroqBackend {
    pub fn new(endpoints: Vec<String>, timeout: Option<Duration>) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            pool: EndpointPool::with_defaults(PROVIDER_NAME, endpoints),
            prices: PriceTable::from_pairs(&[
                ("llama-3.1-8b-instant", "0.00005", "0.00008"),
                ("llama-3.3-70b-versatile", "0.00059", "0.00079"),
                ("mixtral-8x7b-32768", "0.00024", "0.00024"),
            ]),
            timeout,
        })
    }

    fn chat_url(endpoint: &str) -> String {
        format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'))
    }

    async fn attempt(
        &self,
        endpoint: &str,
        request: &PreparedRequest,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, AttemptFailure> {
        let headers = auth_headers(&request.api_key).map_err(AttemptFailure::Fatal)?;
        let body = build_request(request, stream);

        let response = match self
            .client
            .post(Self::chat_url(endpoint))
            .headers(headers)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Groq endpoint '{}' unreachable: {}", endpoint, e);
                return Err(AttemptFailure::Endpoint {
                    timed_out: e.is_timeout(),
                });
            }
        };

        let status = response.status();
        match classify_status(status, retry_after_secs(response.headers())) {
            HttpOutcome::Success => Ok(response),
            HttpOutcome::RateLimited(retry_after) => Err(AttemptFailure::Fatal(Error::RateLimited {
                retry_after_secs: retry_after,
            })),
            HttpOutcome::CallerError => Err(AttemptFailure::Fatal(Error::bad_request(format!(
                "Provider rejected the request with status {}",
                status
            )))),
            HttpOutcome::EndpointFailure => {
                warn!("Groq endpoint '{}' returned {}", endpoint, status);
                Err(AttemptFailure::Endpoint { timed_out: false })
            }
        }
    }

    /// Try endpoints in rotation until one accepts the call, bounded by the
    /// pool size. Only transport errors and 5xx rotate; 429/4xx surface
    /// immediately without marking the endpoint.
    async fn call_with_rotation(
        &self,
        request: &PreparedRequest,
        stream: bool,
    ) -> Result<(String, reqwest::Response)> {
        let attempts = self.pool.len().max(1);
        let mut timed_out = false;

        for _ in 0..attempts {
            let endpoint = self.pool.acquire()?;
            match self.attempt(&endpoint, request, stream).await {
                Ok(response) => {
                    self.pool.record_success(&endpoint);
                    return Ok((endpoint, response));
                }
                Err(AttemptFailure::Endpoint { timed_out: t }) => {
                    timed_out |= t;
                    self.pool.record_failure(&endpoint);
                }
                Err(AttemptFailure::Fatal(e)) => return Err(e),
            }
        }

        if timed_out {
            Err(Error::ProviderTimeout {
                provider: PROVIDER_NAME.to_string(),
                timeout_secs: self.timeout.as_secs(),
            })
        } else {
            Err(Error::AllEndpointsUnavailable {
                provider: PROVIDER_NAME.to_string(),
            })
        }
    }
}

enum AttemptFailure {
    /// Transport error or 5xx; rotate to the next endpoint.
    Endpoint { timed_out: bool },
    /// Surface to the caller without further attempts.
    Fatal(Error),
}

#[async_trait]
impl ProviderBackend for GroqBackend {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn infer(&self, request: &PreparedRequest) -> Result<InferenceResult> {
        let started = Instant::now();
        let (endpoint, response) = self.call_with_rotation(request, false).await?;

        let wire: WireResponse = response.json().await?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("Groq response carried no choices"))?;
        let content = choice.message.content.unwrap_or_default();

        let usage = wire
            .usage
            .as_ref()
            .map(TokenUsage::from)
            .unwrap_or_else(|| {
                // Providers occasionally omit usage; fall back to estimates.
                let input: u32 = request
                    .messages
                    .iter()
                    .map(|m| pricing::estimate_tokens(&m.content))
                    .sum();
                TokenUsage::new(input, pricing::estimate_tokens(&content))
            });

        let (price_in, price_out) = self.prices.resolve(
            &request.model_id,
            request.price_in_per_1k,
            request.price_out_per_1k,
        );

        debug!(
            "Groq completion for '{}' via '{}': {} tokens",
            request.model_id, endpoint, usage.total_tokens
        );

        Ok(InferenceResult {
            request_id: request.request_id.clone(),
            model_id: request.model_id.clone(),
            content: ResultContent::Text(content),
            usage,
            cost_cents: pricing::cost_cents(&usage, price_in, price_out),
            latency_ms: started.elapsed().as_millis() as u64,
            endpoint,
            finish_reason: choice.finish_reason,
        })
    }

    async fn infer_stream(&self, request: &PreparedRequest) -> Result<ChunkStream> {
        let (endpoint, response) = self.call_with_rotation(request, true).await?;

        let (tx, rx) = mpsc::channel(32);
        spawn_sse_forwarder(PROVIDER_NAME, response, tx);
        Ok(ChunkStream::new(endpoint, rx))
    }

    async fn health_check(&self) -> HealthStatus {
        let endpoint = match self.pool.acquire() {
            Ok(endpoint) => endpoint,
            Err(e) => return HealthStatus::unhealthy(e.to_string()),
        };

        let url = format!("{}/v1/models", endpoint.trim_end_matches('/'));
        let started = Instant::now();
        match self.client.get(&url).send().await {
            // Reachability check: 401 without credentials still means the
            // endpoint is up.
            Ok(response) if !response.status().is_server_error() => {
                HealthStatus::healthy(started.elapsed().as_millis() as u64)
            }
            Ok(response) => {
                HealthStatus::unhealthy(format!("Endpoint returned {}", response.status()))
            }
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }

    fn on_config_updated(&self, model_id: &str, endpoints: &[String]) {
        debug!(
            "Groq endpoint list updated via model '{}' ({} endpoints)",
            model_id,
            endpoints.len()
        );
        self.pool.replace_endpoints(endpoints);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_normalization() {
        assert_eq!(
            GroqBackend::chat_url("https://api.groq.com/openai/"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(
            GroqBackend::chat_url("https://api.groq.com/openai"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn test_config_update_replaces_pool() {
        let backend = GroqBackend::new(vec!["https://a".into()], None).unwrap();
        backend.on_config_updated("llama-3.1-8b-instant", &["https://b".into()]);
        assert_eq!(backend.pool.endpoints(), vec!["https://b"]);
    }

    #[tokio::test]
    async fn test_empty_pool_yields_all_endpoints_unavailable() {
        let backend = GroqBackend::new(vec![], None).unwrap();
        let request = PreparedRequest {
            request_id: "r1".into(),
            model_id: "llama-3.1-8b-instant".into(),
            messages: vec![],
            inputs: vec![],
            max_tokens: None,
            temperature: None,
            top_p: None,
            api_key: "k".into(),
            price_in_per_1k: Default::default(),
            price_out_per_1k: Default::default(),
        };
        assert!(matches!(
            backend.infer(&request).await,
            Err(Error::AllEndpointsUnavailable { .. })
        ));
    }
}

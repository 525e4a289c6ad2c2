use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::providers::backend::{
    classify_status, retry_after_secs, ChunkStream, HealthStatus, HttpOutcome, InferenceResult,
    PreparedRequest, ProviderBackend, ResultContent, TokenUsage,
};
use crate::providers::circuit_breaker::CircuitBreaker;
use crate::providers::openai_wire::{auth_headers, build_request, spawn_sse_forwarder, WireResponse};
use crate::providers::pricing::{self, PriceTable};

pub const PROVIDER_NAME: &str = "nim";
// NIM typically fronts larger self-hosted models; generation runs long.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// NVIDIA NIM adapter: OpenAI-style chat completions with one circuit
/// breaker per physical endpoint.
pub struct NimBackend {
    client: Client,
    breakers: RwLock<Vec<CircuitBreaker>>,
    prices: PriceTable,
    timeout: Duration,
}

impl NimBackend {
    pub fn new(endpoints: Vec<String>, timeout: Option<Duration>) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            breakers: RwLock::new(
                endpoints
                    .into_iter()
                    .map(CircuitBreaker::with_defaults)
                    .collect(),
            ),
            // Self-hosted deployments are priced by the registry; no static
            // defaults.
            prices: PriceTable::from_pairs(&[]),
            timeout,
        })
    }

    fn chat_url(endpoint: &str) -> String {
        format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'))
    }

    /// Endpoints whose breaker currently admits traffic, in listed order.
    fn live_endpoints(&self) -> Vec<CircuitBreaker> {
        self.breakers
            .read()
            .iter()
            .filter(|b| b.allow_request())
            .cloned()
            .collect()
    }

    async fn call_with_failover(
        &self,
        request: &PreparedRequest,
        stream: bool,
    ) -> Result<(String, reqwest::Response)> {
        let candidates = self.live_endpoints();
        if candidates.is_empty() {
            return Err(Error::AllEndpointsUnavailable {
                provider: PROVIDER_NAME.to_string(),
            });
        }

        let mut timed_out = false;
        for breaker in &candidates {
            let endpoint = breaker.endpoint().to_string();
            let headers = auth_headers(&request.api_key)?;
            let body = build_request(request, stream);

            let response = match self
                .client
                .post(Self::chat_url(&endpoint))
                .headers(headers)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("NIM endpoint '{}' unreachable: {}", endpoint, e);
                    timed_out |= e.is_timeout();
                    breaker.record_failure();
                    continue;
                }
            };

            let status = response.status();
            match classify_status(status, retry_after_secs(response.headers())) {
                HttpOutcome::Success => {
                    breaker.record_success();
                    return Ok((endpoint, response));
                }
                HttpOutcome::RateLimited(retry_after) => {
                    return Err(Error::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }
                HttpOutcome::CallerError => {
                    return Err(Error::bad_request(format!(
                        "Provider rejected the request with status {}",
                        status
                    )));
                }
                HttpOutcome::EndpointFailure => {
                    warn!("NIM endpoint '{}' returned {}", endpoint, status);
                    breaker.record_failure();
                }
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

#[async_trait]
impl ProviderBackend for NimBackend {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn infer(&self, request: &PreparedRequest) -> Result<InferenceResult> {
        let started = Instant::now();
        let (endpoint, response) = self.call_with_failover(request, false).await?;

        let wire: WireResponse = response.json().await?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("NIM response carried no choices"))?;
        let content = choice.message.content.unwrap_or_default();

        let usage = wire
            .usage
            .as_ref()
            .map(TokenUsage::from)
            .unwrap_or_else(|| {
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
            "NIM completion for '{}' via '{}': {} tokens in {}ms",
            request.model_id,
            endpoint,
            usage.total_tokens,
            started.elapsed().as_millis()
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
        let (endpoint, response) = self.call_with_failover(request, true).await?;

        let (tx, rx) = mpsc::channel(32);
        spawn_sse_forwarder(PROVIDER_NAME, response, tx);
        Ok(ChunkStream::new(endpoint, rx))
    }

    async fn health_check(&self) -> HealthStatus {
        let Some(endpoint) = self
            .breakers
            .read()
            .first()
            .map(|b| b.endpoint().to_string())
        else {
            return HealthStatus::unhealthy("No endpoints configured");
        };

        let url = format!("{}/v1/models", endpoint.trim_end_matches('/'));
        let started = Instant::now();
        match self.client.get(&url).send().await {
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
            "NIM endpoint list updated via model '{}' ({} endpoints)",
            model_id,
            endpoints.len()
        );
        let mut breakers = self.breakers.write();
        let mut next = Vec::with_capacity(endpoints.len());
        for url in endpoints {
            if let Some(pos) = breakers.iter().position(|b| b.endpoint() == url) {
                // Keep breaker state for endpoints that survive the change.
                next.push(breakers.remove(pos));
            } else {
                next.push(CircuitBreaker::with_defaults(url.clone()));
            }
        }
        *breakers = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(endpoints: &[&str]) -> NimBackend {
        NimBackend::new(endpoints.iter().map(|s| s.to_string()).collect(), None).unwrap()
    }

    fn request() -> PreparedRequest {
        PreparedRequest {
            request_id: "r1".into(),
            model_id: "meta/llama-3.1-70b-instruct".into(),
            messages: vec![],
            inputs: vec![],
            max_tokens: None,
            temperature: None,
            top_p: None,
            api_key: "k".into(),
            price_in_per_1k: Default::default(),
            price_out_per_1k: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_all_breakers_open_short_circuits() {
        let b = backend(&["https://e1", "https://e2"]);
        {
            let breakers = b.breakers.read();
            for breaker in breakers.iter() {
                for _ in 0..5 {
                    breaker.record_failure();
                }
            }
        }

        // Every endpoint blocked: fail before any outbound call.
        assert!(matches!(
            b.infer(&request()).await,
            Err(Error::AllEndpointsUnavailable { .. })
        ));
    }

    #[test]
    fn test_config_update_preserves_breaker_state() {
        let b = backend(&["https://e1", "https://e2"]);
        {
            let breakers = b.breakers.read();
            for _ in 0..5 {
                breakers[0].record_failure();
            }
            assert!(breakers[0].is_open());
        }

        b.on_config_updated("m1", &["https://e1".into(), "https://e3".into()]);
        let breakers = b.breakers.read();
        assert_eq!(breakers.len(), 2);
        assert!(breakers[0].is_open());
        assert!(breakers[1].is_closed());
    }
}

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::providers::backend::{
    classify_status, retry_after_secs, ChunkStream, HealthStatus, HttpOutcome, InferenceResult,
    PreparedRequest, ProviderBackend, ResultContent, TokenUsage,
};
use crate::providers::circuit_breaker::CircuitBreaker;
use crate::providers::openai_wire::auth_headers;
use crate::providers::pricing::{self, PriceTable};

pub const PROVIDER_NAME: &str = "external";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u32,
}

/// Adapter for the externally hosted BGE-M3 embedding service: a bespoke
/// `/v1/embeddings` + `/health` pair. Embedding calls never stream.
pub struct ExternalBackend {
    client: Client,
    breakers: RwLock<Vec<CircuitBreaker>>,
    prices: PriceTable,
    timeout: Duration,
}

impl ExternalBackend {
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
            prices: PriceTable::from_pairs(&[("bge-m3", "0.00002", "0")]),
            timeout,
        })
    }

    fn embeddings_url(endpoint: &str) -> String {
        format!("{}/v1/embeddings", endpoint.trim_end_matches('/'))
    }

    fn health_url(endpoint: &str) -> String {
        format!("{}/health", endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProviderBackend for ExternalBackend {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn infer(&self, request: &PreparedRequest) -> Result<InferenceResult> {
        if request.inputs.is_empty() {
            return Err(Error::bad_request("Embedding request carries no inputs"));
        }

        let candidates: Vec<CircuitBreaker> = self
            .breakers
            .read()
            .iter()
            .filter(|b| b.allow_request())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(Error::AllEndpointsUnavailable {
                provider: PROVIDER_NAME.to_string(),
            });
        }

        let started = Instant::now();
        let mut timed_out = false;

        for breaker in &candidates {
            let endpoint = breaker.endpoint().to_string();
            let headers = auth_headers(&request.api_key)?;
            let body = EmbeddingRequest {
                model: &request.model_id,
                input: &request.inputs,
            };

            let response = match self
                .client
                .post(Self::embeddings_url(&endpoint))
                .headers(headers)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("BGE endpoint '{}' unreachable: {}", endpoint, e);
                    timed_out |= e.is_timeout();
                    breaker.record_failure();
                    continue;
                }
            };

            let status = response.status();
            match classify_status(status, retry_after_secs(response.headers())) {
                HttpOutcome::Success => {
                    breaker.record_success();

                    let wire: EmbeddingResponse = response.json().await?;
                    let input_tokens = wire
                        .usage
                        .map(|u| u.prompt_tokens)
                        .unwrap_or_else(|| {
                            request.inputs.iter().map(|s| pricing::estimate_tokens(s)).sum()
                        });
                    let usage = TokenUsage::new(input_tokens, 0);
                    let embeddings: Vec<Vec<f32>> =
                        wire.data.into_iter().map(|row| row.embedding).collect();

                    let (price_in, price_out) = self.prices.resolve(
                        &request.model_id,
                        request.price_in_per_1k,
                        request.price_out_per_1k,
                    );

                    debug!(
                        "BGE embeddings for '{}' via '{}': {} vectors, {} tokens",
                        request.model_id,
                        endpoint,
                        embeddings.len(),
                        usage.input_tokens
                    );

                    return Ok(InferenceResult {
                        request_id: request.request_id.clone(),
                        model_id: request.model_id.clone(),
                        content: ResultContent::Embeddings(embeddings),
                        usage,
                        cost_cents: pricing::cost_cents(&usage, price_in, price_out),
                        latency_ms: started.elapsed().as_millis() as u64,
                        endpoint,
                        finish_reason: None,
                    });
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
                    warn!("BGE endpoint '{}' returned {}", endpoint, status);
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

    async fn infer_stream(&self, _request: &PreparedRequest) -> Result<ChunkStream> {
        Err(Error::bad_request(
            "Embedding models do not support streaming",
        ))
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

        let started = Instant::now();
        match self.client.get(Self::health_url(&endpoint)).send().await {
            Ok(response) if response.status().is_success() => {
                HealthStatus::healthy(started.elapsed().as_millis() as u64)
            }
            Ok(response) => {
                HealthStatus::unhealthy(format!("Health endpoint returned {}", response.status()))
            }
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }

    fn on_config_updated(&self, model_id: &str, endpoints: &[String]) {
        debug!(
            "BGE endpoint list updated via model '{}' ({} endpoints)",
            model_id,
            endpoints.len()
        );
        let mut breakers = self.breakers.write();
        let mut next = Vec::with_capacity(endpoints.len());
        for url in endpoints {
            if let Some(pos) = breakers.iter().position(|b| b.endpoint() == url) {
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

    fn request(inputs: Vec<String>) -> PreparedRequest {
        PreparedRequest {
            request_id: "r1".into(),
            model_id: "bge-m3".into(),
            messages: vec![],
            inputs,
            max_tokens: None,
            temperature: None,
            top_p: None,
            api_key: "k".into(),
            price_in_per_1k: Default::default(),
            price_out_per_1k: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_streaming_rejected() {
        let backend = ExternalBackend::new(vec!["https://e1".into()], None).unwrap();
        assert!(matches!(
            backend.infer_stream(&request(vec!["text".into()])).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_inputs_rejected() {
        let backend = ExternalBackend::new(vec!["https://e1".into()], None).unwrap();
        assert!(matches!(
            backend.infer(&request(vec![])).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_url_shapes() {
        assert_eq!(
            ExternalBackend::embeddings_url("https://bge.internal/"),
            "https://bge.internal/v1/embeddings"
        );
        assert_eq!(
            ExternalBackend::health_url("https://bge.internal"),
            "https://bge.internal/health"
        );
    }
}

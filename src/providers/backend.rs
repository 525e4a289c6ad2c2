use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Internal message roles. `Agent` is the gateway's name for model output
/// turns; adapters translate it to whatever the provider wire format calls
/// it (OpenAI-style APIs use `assistant`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }
}

/// Fully resolved dispatch unit handed to a backend: admission has passed,
/// parameters are merged, and the tenant's API key is attached.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request_id: String,
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    /// Inputs for embedding models; empty for chat.
    pub inputs: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub api_key: String,
    pub price_in_per_1k: Decimal,
    pub price_out_per_1k: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResultContent {
    Text(String),
    Embeddings(Vec<Vec<f32>>),
}

#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub request_id: String,
    pub model_id: String,
    pub content: ResultContent,
    pub usage: TokenUsage,
    pub cost_cents: i64,
    pub latency_ms: u64,
    pub endpoint: String,
    pub finish_reason: Option<String>,
}

/// One streamed text delta. The final chunk may carry provider-reported
/// usage when the stream ends with a usage frame.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Ordered channel of stream chunks from one provider call.
pub struct ChunkStream {
    endpoint: String,
    rx: mpsc::Receiver<Result<StreamChunk>>,
}

impl ChunkStream {
    pub fn new(endpoint: impl Into<String>, rx: mpsc::Receiver<Result<StreamChunk>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            rx,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next chunk in generation order; None once the stream has completed.
    pub async fn recv(&mut self) -> Option<Result<StreamChunk>> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for ChunkStream {
    type Item = Result<StreamChunk>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl HealthStatus {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            is_healthy: true,
            last_check: Utc::now(),
            response_time_ms: Some(response_time_ms),
            error_message: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            is_healthy: false,
            last_check: Utc::now(),
            response_time_ms: None,
            error_message: Some(error.into()),
        }
    }
}

/// Uniform classification of a provider HTTP response. 429 and caller
/// errors never count against endpoint health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpOutcome {
    Success,
    /// 5xx: mark the endpoint failed and try the next candidate.
    EndpointFailure,
    /// 429: surface immediately with retry-after when present.
    RateLimited(Option<u64>),
    /// Other 4xx: caller error, no retry, no failure recorded.
    CallerError,
}

pub fn classify_status(status: reqwest::StatusCode, retry_after_secs: Option<u64>) -> HttpOutcome {
    if status.is_success() {
        HttpOutcome::Success
    } else if status.as_u16() == 429 {
        HttpOutcome::RateLimited(retry_after_secs)
    } else if status.is_client_error() {
        HttpOutcome::CallerError
    } else {
        HttpOutcome::EndpointFailure
    }
}

pub fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Uniform dispatch surface over heterogeneous providers. Each backend owns
/// its endpoint list and circuit-breaker state.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn infer(&self, request: &PreparedRequest) -> Result<InferenceResult>;

    async fn infer_stream(&self, request: &PreparedRequest) -> Result<ChunkStream>;

    async fn health_check(&self) -> HealthStatus;

    /// Registry-driven endpoint update for models routed to this backend.
    fn on_config_updated(&self, model_id: &str, endpoints: &[String]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK, None), HttpOutcome::Success);
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            HttpOutcome::EndpointFailure
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(7)),
            HttpOutcome::RateLimited(Some(7))
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, None),
            HttpOutcome::CallerError
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            HttpOutcome::CallerError
        );
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(retry_after_secs(&headers), Some(30));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        // HTTP-date form is not parsed; treated as absent.
        assert_eq!(retry_after_secs(&headers), None);
    }
}

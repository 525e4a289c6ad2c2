pub mod backend;
pub mod bge;
pub mod circuit_breaker;
pub mod endpoint_pool;
pub mod groq;
pub mod nim;
pub mod openai_wire;
pub mod pricing;

pub use backend::{
    ChatMessage, ChunkStream, HealthStatus, InferenceResult, PreparedRequest, ProviderBackend,
    ResultContent, Role, StreamChunk, TokenUsage,
};
pub use bge::ExternalBackend;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use endpoint_pool::EndpointPool;
pub use groq::GroqBackend;
pub use nim::NimBackend;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Admission layer
    #[error("Invalid capability token: {0}")]
    InvalidToken(String),

    #[error("Capability token has expired")]
    ExpiredToken,

    #[error("No capability for resource '{resource}'")]
    NoCapability { resource: String },

    #[error("Action '{action}' not allowed for resource '{resource}'")]
    ActionNotAllowed { resource: String, action: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Rate limit exceeded for tenant '{tenant_id}'")]
    RateLimitExceeded { tenant_id: String },

    // Resolution layer
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Tenant '{tenant_id}' has no access to model '{model_id}'")]
    AccessDenied { tenant_id: String, model_id: String },

    // Execution layer
    #[error("All endpoints unavailable for provider '{provider}'")]
    AllEndpointsUnavailable { provider: String },

    #[error("Provider rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Provider '{provider}' timed out after {timeout_secs}s")]
    ProviderTimeout { provider: String, timeout_secs: u64 },

    // Credential layer
    #[error("No API key configured for tenant '{tenant_domain}' and provider '{provider}'")]
    ApiKeyNotConfigured {
        tenant_domain: String,
        provider: String,
    },

    // Infrastructure
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_token(msg: impl Into<String>) -> Self {
        Error::InvalidToken(msg.into())
    }

    pub fn constraint_violation(msg: impl Into<String>) -> Self {
        Error::ConstraintViolation(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Status class shown to the caller. Provider error bodies are never
    /// echoed; only the variant decides the outward mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidToken(_) | Error::ExpiredToken => 401,
            Error::NoCapability { .. }
            | Error::ActionNotAllowed { .. }
            | Error::ConstraintViolation(_)
            | Error::AccessDenied { .. }
            | Error::ApiKeyNotConfigured { .. } => 403,
            Error::RateLimitExceeded { .. } | Error::RateLimited { .. } => 429,
            Error::ModelNotFound(_) | Error::ModelUnavailable(_) => 404,
            Error::BadRequest(_) => 400,
            Error::AllEndpointsUnavailable { .. } | Error::ProviderTimeout { .. } => 503,
            _ => 500,
        }
    }

    /// True for transient execution-layer failures that count against an
    /// endpoint's circuit breaker. 429 and caller errors never do.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            Error::ProviderTimeout { .. } | Error::Http(_) | Error::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::ExpiredToken.http_status(), 401);
        assert_eq!(
            Error::AccessDenied {
                tenant_id: "t1".into(),
                model_id: "m1".into()
            }
            .http_status(),
            403
        );
        assert_eq!(Error::ModelNotFound("x".into()).http_status(), 404);
        assert_eq!(
            Error::RateLimited {
                retry_after_secs: Some(5)
            }
            .http_status(),
            429
        );
        assert_eq!(
            Error::AllEndpointsUnavailable {
                provider: "groq".into()
            }
            .http_status(),
            503
        );
    }

    #[test]
    fn test_endpoint_failure_classification() {
        assert!(Error::ProviderTimeout {
            provider: "nim".into(),
            timeout_secs: 120
        }
        .is_endpoint_failure());
        assert!(!Error::RateLimited {
            retry_after_secs: None
        }
        .is_endpoint_failure());
        assert!(!Error::BadRequest("bad".into()).is_endpoint_failure());
    }
}

use http::StatusCode;
use thiserror::Error;

use crate::models::Provider;

/// Failures on the request path. Accounting-path failures never surface here.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider {0} not supported")]
    ProviderNotSupported(Provider),

    #[error("model {0} not found")]
    ModelNotFound(String),

    #[error("model {model} is not offered by provider {provider}")]
    ModelProviderMismatch { model: String, provider: Provider },

    #[error("no active API key for provider {0}")]
    NoActiveKey(Provider),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("{provider} request failed: {message}")]
    ProviderInvocation { provider: Provider, message: String },

    #[error("{0} returned no candidates")]
    EmptyResponse(Provider),

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn invocation(provider: Provider, message: impl Into<String>) -> Self {
        GatewayError::ProviderInvocation {
            provider,
            message: message.into(),
        }
    }

    /// 4xx for caller mistakes, 5xx for operational and upstream failures.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_)
            | GatewayError::ProviderNotSupported(_)
            | GatewayError::ModelNotFound(_)
            | GatewayError::ModelProviderMismatch { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NoActiveKey(_) | GatewayError::Store(_) | GatewayError::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::ProviderInvocation { .. } | GatewayError::EmptyResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            GatewayError::Cancelled | GatewayError::DeadlineExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_mistakes_map_to_bad_request() {
        assert_eq!(
            GatewayError::ModelNotFound("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ProviderNotSupported(Provider::Mistral).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn operational_failures_map_to_server_errors() {
        for err in [
            GatewayError::NoActiveKey(Provider::Groq),
            GatewayError::EmptyResponse(Provider::Google),
            GatewayError::invocation(Provider::OpenAI, "boom"),
            GatewayError::Cancelled,
            GatewayError::DeadlineExceeded,
        ] {
            assert!(err.status_code().is_server_error(), "{err}");
        }
    }
}

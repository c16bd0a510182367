// Error handling and HTTP status code mapping for Cloudflare Workers

#[cfg(target_arch = "wasm32")]
use pageview_queue::QueueError;
use serde::Serialize;
use worker::Response;

/// Body returned to the client when a pageview could not be recorded.
pub(crate) const TRACK_ERROR_BODY: &str = "Error processing pageview";

/// Error classification with HTTP status code mapping
#[derive(Debug)]
#[non_exhaustive]
pub enum PageviewErrorKind {
    /// 400 - Request could not be turned into a pageview
    InvalidRequest(String),
    /// 500 - Misconfiguration
    ConfigError(String),
    /// 502 - Durable Object storage or routing failure
    StorageError(String),
}

impl PageviewErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::ConfigError(_) => 500,
            Self::StorageError(_) => 502,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::ConfigError(_) => "ConfigError",
            Self::StorageError(_) => "StorageError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidRequest(msg) | Self::ConfigError(msg) | Self::StorageError(msg) => msg,
        }
    }
}

/// Standardized JSON error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn from_error(error: &PageviewErrorKind) -> Self {
        Self {
            error: error.error_type().to_string(),
            message: error.message().to_string(),
        }
    }

    /// Convert into worker::Response with appropriate status code
    pub fn into_response(self, status_code: u16) -> worker::Result<Response> {
        Ok(Response::from_json(&self)?.with_status(status_code))
    }
}

/// Surface a queue failure through the Workers error type.
#[cfg(target_arch = "wasm32")]
pub(crate) fn queue_error(err: QueueError) -> worker::Error {
    worker::Error::RustError(format!("queue operation failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            PageviewErrorKind::InvalidRequest("bad".into()).status_code(),
            400
        );
        assert_eq!(PageviewErrorKind::ConfigError("bad".into()).status_code(), 500);
        assert_eq!(PageviewErrorKind::StorageError("bad".into()).status_code(), 502);
    }

    #[test]
    fn test_error_response_serialization() {
        let err = PageviewErrorKind::InvalidRequest("queue name is empty".into());
        let json = serde_json::to_value(ErrorResponse::from_error(&err)).unwrap();
        assert_eq!(json["error"], "InvalidRequest");
        assert_eq!(json["message"], "queue name is empty");
    }

    #[cfg(target_arch = "wasm32")]
    #[test]
    fn test_queue_error_keeps_cause() {
        use pageview_queue::SinkError;

        let err = queue_error(QueueError::Sink(SinkError::new("analytics down")));
        assert!(err.to_string().contains("analytics down"));
    }
}

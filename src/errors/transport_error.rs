use super::RequestError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout(timeout_ms);
        }
        if err.is_connect() {
            return TransportError::Connect(err.to_string());
        }
        if err.is_builder() {
            return TransportError::InvalidRequest(err.to_string());
        }
        if err.is_body() || err.is_decode() {
            return TransportError::Body(err.to_string());
        }
        TransportError::Other(err.to_string())
    }
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Connect(_) => "connect",
            TransportError::Timeout(_) => "timeout",
            TransportError::InvalidRequest(_) => "invalid_request",
            TransportError::Body(_) => "body",
            TransportError::Other(_) => "other",
        };
        let mapped = match &err {
            TransportError::Timeout(_) => RequestError::timeout(err.to_string()),
            TransportError::InvalidRequest(_) => RequestError::validation(err.to_string()),
            _ => RequestError::network(err.to_string()),
        };
        mapped.with_detail("transport", serde_json::json!({ "kind": kind }))
    }
}

use crate::errors::RequestError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub timestamp: String,
    pub request_id: String,
    pub duration_ms: u64,
    pub cached: bool,
}

/// What every pipeline call returns, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
    pub metadata: ResponseMetadata,
}

impl ResponseEnvelope {
    pub fn ok(data: Value, metadata: ResponseMetadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    pub fn err(error: RequestError, metadata: ResponseMetadata) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata,
        }
    }

    pub fn into_result(self) -> Result<Value, RequestError> {
        match (self.success, self.data, self.error) {
            (true, data, _) => Ok(data.unwrap_or(Value::Null)),
            (false, _, Some(err)) => Err(err),
            (false, _, None) => Err(RequestError::unknown("Request failed without error details")),
        }
    }

    /// Deserializes `data` into `T`; a shape mismatch becomes `VALIDATION_ERROR`.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, RequestError> {
        let request_id = self.metadata.request_id.clone();
        let data = self.into_result()?;
        serde_json::from_value(data).map_err(|err| {
            RequestError::from(err).with_detail("request_id", Value::String(request_id))
        })
    }
}

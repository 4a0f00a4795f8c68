use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure to get any HTTP response from the backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// 2xx with no `"status": false` envelope in the body
    pub fn is_accepted(&self) -> bool {
        if !(200..300).contains(&self.status) {
            return false;
        }
        !matches!(
            self.json().as_ref().and_then(|v| v.get("status")),
            Some(Value::Bool(false))
        )
    }
}

// Backend-side port
#[async_trait]
pub trait TransportPort: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        token: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError>;
}

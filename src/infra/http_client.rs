use crate::app::ports::{TransportError, TransportPort, TransportResponse};
use crate::constants::AUTH_HEADER;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sensor_bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransportPort for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        token: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .post(url)
            .header(AUTH_HEADER, token)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(classify)?;
        Ok(TransportResponse { status, body })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

//! Forwarding of normalized events and image assets to the telemetry backend.

pub mod dead_letter;
pub mod request;
pub mod retry;
pub mod worker;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::ports::{TransportError, TransportPort, TransportResponse};
use crate::config::DeliveryConfig;
use crate::constants::{ACCOUNT_TOKEN_ENV, DEVICE_TOKEN_ENV, FIELD_EVENT_ID, FIELD_IMAGE};
use crate::metrics::delivery::DeliveryMetrics;
use crate::types::{EventField, NormalizedEvent, RequestId};

pub use dead_letter::{DeadLetterEntry, DeadLetterLog, DeadLetterPayload};
pub use request::{AssetUpload, DeliveryOutcome, DeliveryRequest};
pub use retry::RetryPolicy;
pub use worker::DeliveryWorker;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("credential {0} is not set")]
    MissingCredential(&'static str),

    #[error("backend rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("gave up after {attempts} attempt(s), last error: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("abandoned at shutdown")]
    Abandoned,

    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("dead-letter log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport unavailable: {0}")]
    Transport(#[from] TransportError),
}

/// The two backend tokens: one authorises event publishes, the other asset uploads
#[derive(Clone)]
pub struct Credentials {
    pub device_token: String,
    pub account_token: String,
}

impl Credentials {
    pub fn new(device_token: impl Into<String>, account_token: impl Into<String>) -> Self {
        Self {
            device_token: device_token.into(),
            account_token: account_token.into(),
        }
    }

    pub fn from_env() -> Result<Self, DeliveryError> {
        let read = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(DeliveryError::MissingCredential(name))
        };
        Ok(Self::new(read(DEVICE_TOKEN_ENV)?, read(ACCOUNT_TOKEN_ENV)?))
    }

    fn validate(&self) -> Result<(), DeliveryError> {
        if self.device_token.trim().is_empty() {
            return Err(DeliveryError::MissingCredential(DEVICE_TOKEN_ENV));
        }
        if self.account_token.trim().is_empty() {
            return Err(DeliveryError::MissingCredential(ACCOUNT_TOKEN_ENV));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("device_token", &"<redacted>")
            .field("account_token", &"<redacted>")
            .finish()
    }
}

pub struct DeliveryClient {
    transport: Arc<dyn TransportPort>,
    credentials: Credentials,
    data_endpoint: String,
    files_endpoint: String,
    file_base_url: String,
    retry: RetryPolicy,
}

impl DeliveryClient {
    /// Both credentials must be present; a client is never built without them.
    pub fn new(
        config: &DeliveryConfig,
        credentials: Credentials,
        transport: Arc<dyn TransportPort>,
    ) -> Result<Self, DeliveryError> {
        credentials.validate()?;
        Ok(Self {
            transport,
            credentials,
            data_endpoint: config.data_endpoint.clone(),
            files_endpoint: config.files_endpoint.clone(),
            file_base_url: config.file_base_url.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Carry a request to a terminal outcome. Cancelling `abandon` interrupts any backoff
    /// or in-flight attempt.
    #[instrument(skip_all, fields(request_id = %request.id(), kind = request.kind()))]
    pub async fn deliver(
        &self,
        request: DeliveryRequest,
        abandon: &CancellationToken,
    ) -> DeliveryOutcome {
        let started = Instant::now();
        let kind = request.kind();

        let outcome = match &request {
            DeliveryRequest::PublishEvent { id, event } => {
                match self.publish_event(*id, event, abandon).await {
                    (attempts, Ok(())) => DeliveryOutcome::Delivered {
                        id: *id,
                        attempts,
                        asset_url: None,
                    },
                    (_, Err(DeliveryError::Abandoned)) => DeliveryOutcome::Abandoned { request },
                    (attempts, Err(error)) => DeliveryOutcome::Failed {
                        request,
                        attempts,
                        error,
                    },
                }
            }
            DeliveryRequest::UploadAsset { id, asset } => {
                let id = *id;
                match self.upload_asset(id, asset, abandon).await {
                    (_, Err(DeliveryError::Abandoned)) => DeliveryOutcome::Abandoned { request },
                    (attempts, Err(error)) => DeliveryOutcome::Failed {
                        request,
                        attempts,
                        error,
                    },
                    (upload_attempts, Ok(asset_url)) => {
                        let metadata = asset_metadata(id, &asset_url);
                        match self.publish_event(id, &metadata, abandon).await {
                            (publish_attempts, Ok(())) => DeliveryOutcome::Delivered {
                                id,
                                attempts: upload_attempts + publish_attempts,
                                asset_url: Some(asset_url),
                            },
                            (_, Err(error)) => DeliveryOutcome::AssetStoredMetadataPending {
                                id,
                                asset_url,
                                metadata,
                                error,
                            },
                        }
                    }
                }
            }
        };

        DeliveryMetrics::record_outcome(kind, &outcome, started.elapsed());
        match &outcome {
            DeliveryOutcome::Delivered { .. } => info!(outcome = %outcome, "Delivery complete"),
            _ => warn!(outcome = %outcome, "Delivery did not complete"),
        }
        outcome
    }

    /// Publish event fields as one batched write
    pub async fn publish_event(
        &self,
        id: RequestId,
        event: &NormalizedEvent,
        abandon: &CancellationToken,
    ) -> (u32, Result<(), DeliveryError>) {
        let body = match serde_json::to_value(event.to_backend_records()) {
            Ok(body) => body,
            Err(e) => return (0, Err(e.into())),
        };
        debug!(request_id = %id, fields = event.len(), "Publishing event");

        let (attempts, result) = self
            .post_with_retry(
                &self.data_endpoint,
                &self.credentials.device_token,
                &body,
                abandon,
            )
            .await;
        (attempts, result.map(|_| ()))
    }

    /// Upload asset bytes, returning the URL the backend serves them from
    pub async fn upload_asset(
        &self,
        id: RequestId,
        asset: &AssetUpload,
        abandon: &CancellationToken,
    ) -> (u32, Result<String, DeliveryError>) {
        info!(
            request_id = %id,
            path = %asset.logical_path,
            bytes = asset.bytes.len(),
            sha256 = %asset.digest(),
            "Uploading asset"
        );
        let body = json!({
            "file": STANDARD.encode(&asset.bytes),
            "filename": asset.logical_path,
            "content_type": asset.content_type,
            "public": asset.public,
        });

        let (attempts, result) = self
            .post_with_retry(
                &self.files_endpoint,
                &self.credentials.account_token,
                &body,
                abandon,
            )
            .await;
        (
            attempts,
            result.map(|resp| self.asset_url(&resp, &asset.logical_path)),
        )
    }

    async fn post_with_retry(
        &self,
        url: &str,
        token: &str,
        body: &Value,
        abandon: &CancellationToken,
    ) -> (u32, Result<TransportResponse, DeliveryError>) {
        let mut attempts = 0;

        loop {
            if abandon.is_cancelled() {
                return (attempts, Err(DeliveryError::Abandoned));
            }
            attempts += 1;
            DeliveryMetrics::record_attempt();

            let result = tokio::select! {
                biased;
                _ = abandon.cancelled() => return (attempts, Err(DeliveryError::Abandoned)),
                r = self.transport.post_json(url, token, body) => r,
            };

            let last = match result {
                Ok(resp) if resp.is_accepted() => return (attempts, Ok(resp)),
                // Also catches a 2xx carrying a failure envelope
                Ok(resp) if !retry::is_retryable_status(resp.status) => {
                    return (
                        attempts,
                        Err(DeliveryError::Rejected {
                            status: resp.status,
                            body: resp.body,
                        }),
                    );
                }
                Ok(resp) => format!("HTTP {}", resp.status),
                Err(e) => e.to_string(),
            };

            if attempts >= self.retry.max_attempts {
                return (attempts, Err(DeliveryError::Exhausted { attempts, last }));
            }

            let delay = self.retry.backoff(attempts);
            warn!(
                attempt = attempts,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Delivery attempt failed, retrying"
            );
            DeliveryMetrics::record_retry();

            tokio::select! {
                _ = abandon.cancelled() => return (attempts, Err(DeliveryError::Abandoned)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn asset_url(&self, response: &TransportResponse, logical_path: &str) -> String {
        let reported = response.json().and_then(|v| match v.get("result") {
            Some(Value::String(s)) if s.starts_with("http") => Some(s.clone()),
            Some(Value::Object(o)) => o
                .get("file")
                .or_else(|| o.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        });
        reported.unwrap_or_else(|| {
            format!("{}/{}", self.file_base_url.trim_end_matches('/'), logical_path)
        })
    }
}

/// Event published after an asset upload so the dashboard can show the image
pub fn asset_metadata(id: RequestId, asset_url: &str) -> NormalizedEvent {
    let mut event = NormalizedEvent::new();
    for field in [
        EventField {
            name: FIELD_EVENT_ID.to_string(),
            value: json!(id.seq),
            unit: None,
        },
        EventField {
            name: FIELD_IMAGE.to_string(),
            value: json!(asset_url),
            unit: None,
        },
    ] {
        // Names are distinct
        let _ = event.push(field);
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestIdGenerator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replies from a script, then repeats the last reply
    struct ScriptedTransport {
        replies: Mutex<Vec<Result<TransportResponse, TransportError>>>,
        calls: AtomicU32,
        seen: Mutex<Vec<(String, String, Value)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportPort for ScriptedTransport {
        async fn post_json(
            &self,
            url: &str,
            token: &str,
            body: &Value,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((url.to_string(), token.to_string(), body.clone()));
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            }
        }
    }

    fn ok(body: &str) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn status(code: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: code,
            body: String::new(),
        })
    }

    fn fast_config(max_attempts: u32) -> DeliveryConfig {
        DeliveryConfig {
            data_endpoint: "http://backend/data".into(),
            files_endpoint: "http://backend/files".into(),
            file_base_url: "http://backend/file/acct/".into(),
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..DeliveryConfig::default()
        }
    }

    fn client(transport: Arc<ScriptedTransport>, max_attempts: u32) -> DeliveryClient {
        DeliveryClient::new(
            &fast_config(max_attempts),
            Credentials::new("device-tok", "account-tok"),
            transport,
        )
        .unwrap()
    }

    fn event() -> NormalizedEvent {
        let mut event = NormalizedEvent::new();
        event
            .push(EventField {
                name: "Event_Type".into(),
                value: json!("TAMPERING"),
                unit: None,
            })
            .unwrap();
        event
    }

    #[test]
    fn test_missing_credential_is_fatal_at_construction() {
        let transport = ScriptedTransport::new(vec![ok("{}")]);
        let result = DeliveryClient::new(
            &DeliveryConfig::default(),
            Credentials::new("device-tok", " "),
            transport,
        );
        assert!(matches!(
            result,
            Err(DeliveryError::MissingCredential("ACCOUNT_TOKEN"))
        ));
    }

    #[tokio::test]
    async fn test_retry_bound_is_exact() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connect(
            "connection refused".into(),
        ))]);
        let client = client(transport.clone(), 4);
        let ids = RequestIdGenerator::new();

        let outcome = client
            .deliver(
                DeliveryRequest::PublishEvent {
                    id: ids.next_id(),
                    event: event(),
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(transport.calls(), 4);
        match outcome {
            DeliveryOutcome::Failed {
                attempts, error, ..
            } => {
                assert_eq!(attempts, 4);
                assert!(matches!(error, DeliveryError::Exhausted { attempts: 4, .. }));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authentication_rejection_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(401)]);
        let client = client(transport.clone(), 5);

        let (attempts, result) = client
            .publish_event(
                RequestIdGenerator::new().next_id(),
                &event(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert!(matches!(
            result,
            Err(DeliveryError::Rejected { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_envelope_is_rejected() {
        let transport =
            ScriptedTransport::new(vec![ok(r#"{"status":false,"message":"Invalid token"}"#)]);
        let client = client(transport.clone(), 3);

        let (_, result) = client
            .publish_event(
                RequestIdGenerator::new().next_id(),
                &event(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(DeliveryError::Rejected { .. })));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            status(503),
            ok(r#"{"status":true,"result":"1 Data Added"}"#),
        ]);
        let client = client(transport.clone(), 3);

        let outcome = client
            .deliver(
                DeliveryRequest::PublishEvent {
                    id: RequestIdGenerator::new().next_id(),
                    event: event(),
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered { attempts: 3, .. }
        ));
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "http://backend/data");
        assert_eq!(seen[0].1, "device-tok");
        assert_eq!(
            seen[0].2,
            json!([{"variable": "Event_Type", "value": "TAMPERING"}])
        );
    }

    #[tokio::test]
    async fn test_asset_upload_publishes_metadata() {
        let transport = ScriptedTransport::new(vec![
            ok(r#"{"status":true,"result":{"file":"https://files.example/img/cap.jpg"}}"#),
            ok(r#"{"status":true}"#),
        ]);
        let client = client(transport.clone(), 3);
        let id = RequestIdGenerator::new().next_id();

        let outcome = client
            .deliver(
                DeliveryRequest::UploadAsset {
                    id,
                    asset: AssetUpload::new("img/cap.jpg", "image/jpeg", b"jpeg".to_vec()),
                },
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            DeliveryOutcome::Delivered {
                attempts,
                asset_url,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    asset_url.as_deref(),
                    Some("https://files.example/img/cap.jpg")
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "http://backend/files");
        assert_eq!(seen[0].1, "account-tok");
        assert_eq!(seen[0].2["file"], json!("anBlZw=="));
        assert_eq!(seen[0].2["filename"], json!("img/cap.jpg"));
        assert_eq!(seen[0].2["public"], json!(true));
        assert_eq!(seen[1].1, "device-tok");
        assert_eq!(
            seen[1].2,
            json!([
                {"variable": "eventId", "value": id.seq},
                {"variable": "image", "value": "https://files.example/img/cap.jpg"}
            ])
        );
    }

    #[tokio::test]
    async fn test_asset_url_falls_back_to_base_url() {
        let transport = ScriptedTransport::new(vec![ok(r#"{"status":true}"#)]);
        let client = client(transport, 1);

        let (_, url) = client
            .upload_asset(
                RequestIdGenerator::new().next_id(),
                &AssetUpload::new("img/x.png", "image/png", vec![1, 2, 3]),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(url.unwrap(), "http://backend/file/acct/img/x.png");
    }

    #[tokio::test]
    async fn test_cancelled_token_abandons_before_first_attempt() {
        let transport = ScriptedTransport::new(vec![ok("{}")]);
        let client = client(transport.clone(), 3);
        let abandon = CancellationToken::new();
        abandon.cancel();

        let outcome = client
            .deliver(
                DeliveryRequest::PublishEvent {
                    id: RequestIdGenerator::new().next_id(),
                    event: event(),
                },
                &abandon,
            )
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Abandoned { .. }));
        assert_eq!(transport.calls(), 0);
    }
}

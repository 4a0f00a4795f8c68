//! NDJSON record of deliveries that did not complete, kept for manual resubmission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{AssetUpload, DeliveryClient, DeliveryError, DeliveryOutcome, DeliveryRequest};
use crate::types::{NormalizedEvent, RequestId, RequestIdGenerator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    Event {
        event: NormalizedEvent,
    },
    /// Asset already stored; only its metadata event is outstanding
    AssetMetadata {
        asset_url: String,
        metadata: NormalizedEvent,
    },
    /// Asset never stored. Bytes are not duplicated into the log, only where to find them.
    Asset {
        logical_path: String,
        content_type: String,
        sha256: String,
        source_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub request_id: RequestId,
    pub recorded_at: DateTime<Utc>,
    pub reason: String,
    #[serde(flatten)]
    pub payload: DeadLetterPayload,
}

impl DeadLetterEntry {
    /// Entry preserving whatever `outcome` left undelivered
    pub fn from_outcome(outcome: &DeliveryOutcome) -> Option<Self> {
        let (request_id, reason, payload) = match outcome {
            DeliveryOutcome::Delivered { .. } => return None,
            DeliveryOutcome::Failed { request, error, .. } => {
                (request.id(), error.to_string(), payload_for(request))
            }
            DeliveryOutcome::Abandoned { request } => (
                request.id(),
                DeliveryError::Abandoned.to_string(),
                payload_for(request),
            ),
            DeliveryOutcome::AssetStoredMetadataPending {
                id,
                asset_url,
                metadata,
                error,
            } => (
                *id,
                error.to_string(),
                DeadLetterPayload::AssetMetadata {
                    asset_url: asset_url.clone(),
                    metadata: metadata.clone(),
                },
            ),
        };

        Some(Self {
            request_id,
            recorded_at: Utc::now(),
            reason,
            payload,
        })
    }

    /// Rebuild a delivery request under a fresh identity. `None` when the asset bytes can no
    /// longer be located.
    pub async fn to_request(&self, id: RequestId) -> std::io::Result<Option<DeliveryRequest>> {
        let request = match &self.payload {
            DeadLetterPayload::Event { event } => DeliveryRequest::PublishEvent {
                id,
                event: event.clone(),
            },
            DeadLetterPayload::AssetMetadata { metadata, .. } => DeliveryRequest::PublishEvent {
                id,
                event: metadata.clone(),
            },
            DeadLetterPayload::Asset {
                source_file: None, ..
            } => return Ok(None),
            DeadLetterPayload::Asset {
                logical_path,
                content_type,
                sha256,
                source_file: Some(path),
            } => {
                let mut asset = AssetUpload::from_file(path).await?;
                if &asset.digest() != sha256 {
                    warn!(path = %path.display(), "Asset changed on disk since the failed upload");
                }
                asset.logical_path = logical_path.clone();
                asset.content_type = content_type.clone();
                DeliveryRequest::UploadAsset { id, asset }
            }
        };
        Ok(Some(request))
    }
}

fn payload_for(request: &DeliveryRequest) -> DeadLetterPayload {
    match request {
        DeliveryRequest::PublishEvent { event, .. } => DeadLetterPayload::Event {
            event: event.clone(),
        },
        DeliveryRequest::UploadAsset { asset, .. } => DeadLetterPayload::Asset {
            logical_path: asset.logical_path.clone(),
            content_type: asset.content_type.clone(),
            sha256: asset.digest(),
            source_file: asset.source_file.clone(),
        },
    }
}

/// Handle to the dead-letter file. Clones share one lock, so the delivery worker's appends
/// never interleave with a drain taken for requeueing.
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // Nothing is guarded but the file, so a poisoned lock is still usable
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, entry: &DeadLetterEntry) -> Result<(), DeliveryError> {
        let _guard = self.guard();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// All readable entries; a missing file is an empty log
    pub fn read_all(&self) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        let _guard = self.guard();
        self.read_locked()
    }

    /// Atomically replace the log contents with `entries`
    pub fn replace(&self, entries: &[DeadLetterEntry]) -> Result<(), DeliveryError> {
        let _guard = self.guard();
        self.replace_locked(entries)
    }

    /// Read every entry and empty the log in one step. Appends made by other holders of this
    /// log land either in the returned entries or in the emptied file, never in between.
    pub fn take_all(&self) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        let _guard = self.guard();
        let entries = self.read_locked()?;
        if !entries.is_empty() || self.path.exists() {
            self.replace_locked(&[])?;
        }
        Ok(entries)
    }

    fn read_locked(&self) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeadLetterEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable dead-letter entry"
                ),
            }
        }
        Ok(entries)
    }

    fn replace_locked(&self, entries: &[DeadLetterEntry]) -> Result<(), DeliveryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("ndjson.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for entry in entries {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Push every dead-lettered entry through `client` again. Entries that still do not deliver,
/// or cannot be rebuilt, remain in the log; the rest are removed.
pub async fn resubmit_all(
    client: &DeliveryClient,
    log: &DeadLetterLog,
    ids: &RequestIdGenerator,
    abandon: &CancellationToken,
) -> Result<Vec<DeliveryOutcome>, DeliveryError> {
    let entries = log.read_all()?;
    info!(count = entries.len(), path = %log.path().display(), "Resubmitting dead-lettered deliveries");

    let mut remaining = Vec::new();
    let mut outcomes = Vec::new();

    for entry in entries {
        let request = match entry.to_request(ids.next_id()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                warn!(request_id = %entry.request_id, "Asset source unknown, leaving entry in place");
                remaining.push(entry);
                continue;
            }
            Err(e) => {
                warn!(request_id = %entry.request_id, error = %e, "Could not rebuild request");
                remaining.push(entry);
                continue;
            }
        };

        let outcome = client.deliver(request, abandon).await;
        if let Some(failed) = DeadLetterEntry::from_outcome(&outcome) {
            remaining.push(failed);
        }
        outcomes.push(outcome);
    }

    log.replace(&remaining)?;
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventField;
    use serde_json::json;

    fn event() -> NormalizedEvent {
        let mut event = NormalizedEvent::new();
        event
            .push(EventField {
                name: "Ultrasonic".into(),
                value: json!("0.54"),
                unit: Some("m".into()),
            })
            .unwrap();
        event
    }

    #[test]
    fn test_delivered_outcome_is_not_recorded() {
        let outcome = DeliveryOutcome::Delivered {
            id: RequestIdGenerator::new().next_id(),
            attempts: 1,
            asset_url: None,
        };
        assert!(DeadLetterEntry::from_outcome(&outcome).is_none());
    }

    #[test]
    fn test_append_then_read_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("nested/dead_letter.ndjson"));
        let ids = RequestIdGenerator::new();

        let failed = DeliveryOutcome::Failed {
            request: DeliveryRequest::PublishEvent {
                id: ids.next_id(),
                event: event(),
            },
            attempts: 3,
            error: DeliveryError::Exhausted {
                attempts: 3,
                last: "request timed out".into(),
            },
        };
        let pending = DeliveryOutcome::AssetStoredMetadataPending {
            id: ids.next_id(),
            asset_url: "https://files.example/img/a.jpg".into(),
            metadata: event(),
            error: DeliveryError::Abandoned,
        };

        log.append(&DeadLetterEntry::from_outcome(&failed).unwrap())
            .unwrap();
        log.append(&DeadLetterEntry::from_outcome(&pending).unwrap())
            .unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, DeadLetterPayload::Event { event: event() });
        assert!(entries[0].reason.contains("3 attempt"));
        assert!(matches!(
            &entries[1].payload,
            DeadLetterPayload::AssetMetadata { asset_url, .. } if asset_url.ends_with("a.jpg")
        ));
    }

    #[test]
    fn test_missing_log_reads_empty_and_bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.ndjson"));
        assert!(log.read_all().unwrap().is_empty());

        std::fs::write(log.path(), "not json\n\n").unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_entry_line_shape() {
        let entry = DeadLetterEntry {
            request_id: RequestIdGenerator::new().next_id(),
            recorded_at: Utc::now(),
            reason: "abandoned at shutdown".into(),
            payload: DeadLetterPayload::Event { event: event() },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["kind"], json!("event"));
        assert_eq!(value["request_id"]["seq"], json!(1));
        assert_eq!(value["event"]["fields"][0]["unit"], json!("m"));
    }

    #[tokio::test]
    async fn test_asset_without_source_cannot_be_rebuilt() {
        let entry = DeadLetterEntry {
            request_id: RequestIdGenerator::new().next_id(),
            recorded_at: Utc::now(),
            reason: "gave up".into(),
            payload: DeadLetterPayload::Asset {
                logical_path: "img/a.jpg".into(),
                content_type: "image/jpeg".into(),
                sha256: String::new(),
                source_file: None,
            },
        };
        let rebuilt = entry
            .to_request(RequestIdGenerator::new().next_id())
            .await
            .unwrap();
        assert!(rebuilt.is_none());
    }

    #[test]
    fn test_take_all_empties_log_and_later_appends_survive() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.ndjson"));
        let worker_view = log.clone();
        let ids = RequestIdGenerator::new();
        let entry = |id| DeadLetterEntry {
            request_id: id,
            recorded_at: Utc::now(),
            reason: "abandoned at shutdown".into(),
            payload: DeadLetterPayload::Event { event: event() },
        };

        let first = entry(ids.next_id());
        worker_view.append(&first).unwrap();
        let taken = log.take_all().unwrap();
        assert_eq!(taken, vec![first]);

        let second = entry(ids.next_id());
        worker_view.append(&second).unwrap();
        assert_eq!(log.read_all().unwrap(), vec![second]);
        assert!(log.take_all().unwrap().len() == 1);
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_appends_during_take_are_never_lost() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.ndjson"));
        let ids = std::sync::Arc::new(RequestIdGenerator::new());

        let writer = {
            let log = log.clone();
            let ids = ids.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    log.append(&DeadLetterEntry {
                        request_id: ids.next_id(),
                        recorded_at: Utc::now(),
                        reason: "gave up".into(),
                        payload: DeadLetterPayload::Event { event: event() },
                    })
                    .unwrap();
                }
            })
        };

        let mut drained = 0;
        while !writer.is_finished() {
            drained += log.take_all().unwrap().len();
        }
        writer.join().unwrap();
        drained += log.take_all().unwrap().len();
        assert_eq!(drained, 200);
    }
}

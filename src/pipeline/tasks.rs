//! Per-source ingestion task: poll, clean, extract, normalize, hand off.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::TailConfig;
use crate::metrics::ingest::IngestMetrics;
use crate::pipeline::delivery::worker::report_outcome;
use crate::pipeline::delivery::{DeadLetterLog, DeliveryOutcome, DeliveryRequest};
use crate::pipeline::ingestion::{LinePoll, TailError, Tailer};
use crate::pipeline::processing::{clean, extract, Normalizer};
use crate::pipeline::PassOutput;
use crate::types::{CandidateRecord, RawLine, RequestIdGenerator, SourceKind};

/// Run one line through the processing stages.
///
/// Only objects from the log source are normalized; device output is interactive shell text
/// and reaches presentation as cleaned text even when it carries JSON.
pub fn process_line(kind: SourceKind, raw: &RawLine, normalizer: &Normalizer) -> PassOutput {
    IngestMetrics::record_line_read(kind);
    let line = clean(&raw.text);
    if line.modified {
        IngestMetrics::record_line_cleaned(kind);
    }

    let record = match extract(&line.text) {
        Some(record) => record,
        None => return PassOutput::Text { source: kind, line },
    };
    IngestMetrics::record_record_extracted(kind);

    match (kind, record) {
        (_, CandidateRecord::Array(items)) => PassOutput::Array {
            source: kind,
            items,
        },
        (SourceKind::Device, CandidateRecord::Object(_)) => PassOutput::Text { source: kind, line },
        (SourceKind::Log, record) => match normalizer.normalize(&record) {
            Ok(event) => {
                IngestMetrics::record_event_normalized();
                PassOutput::Event {
                    source: kind,
                    event,
                    request_id: None,
                }
            }
            Err(e) => {
                IngestMetrics::record_normalize_error();
                warn!(source = %kind, error = %e, "Record could not be normalized");
                PassOutput::Text { source: kind, line }
            }
        },
    }
}

pub struct IngestTask {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub tail: TailConfig,
    pub outputs: mpsc::Sender<PassOutput>,
    /// Present only for the source whose events are forwarded
    pub delivery: Option<mpsc::Sender<DeliveryRequest>>,
    pub normalizer: Arc<Normalizer>,
    pub ids: Arc<RequestIdGenerator>,
    /// Where events that never reach the delivery queue are preserved
    pub dead_letter: Option<DeadLetterLog>,
}

impl IngestTask {
    fn poll_interval(&self) -> std::time::Duration {
        match self.kind {
            SourceKind::Log => self.tail.log_poll_interval(),
            SourceKind::Device => self.tail.device_poll_interval(),
        }
    }

    #[instrument(skip_all, fields(source = %self.kind))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut tailer = match Tailer::open(&self.path, self.kind, &self.tail).await {
            Ok(tailer) => tailer,
            Err(e) => {
                error!(error = %e, "Source unavailable, ingestion task exiting");
                IngestMetrics::record_source_error(self.kind, true);
                self.report_error(&e, true).await;
                return;
            }
        };
        let poll = self.poll_interval();

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = tailer.next_line() => polled,
            };

            match polled {
                Ok(LinePoll::Line(raw)) => self.hand_off(&raw, &cancel).await,
                Ok(LinePoll::Pending) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    warn!(error = %e, "Read from source failed");
                    IngestMetrics::record_source_error(self.kind, fatal);
                    self.report_error(&e, fatal).await;
                    if fatal {
                        return;
                    }
                    if !self.reopen_after_backoff(&mut tailer, &cancel).await {
                        return;
                    }
                }
            }
        }

        // Lines already read in full are not lost to shutdown
        let buffered = tailer.take_buffered_lines();
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "Flushing buffered lines at shutdown");
        }
        for raw in buffered {
            self.hand_off(&raw, &cancel).await;
        }
        info!("Ingestion task stopped");
    }

    /// Returns false when the task should stop
    async fn reopen_after_backoff(&self, tailer: &mut Tailer, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.tail.reopen_backoff()) => {}
            }
            match tailer.reopen().await {
                Ok(()) => return true,
                Err(e) => warn!(error = %e, "Re-open failed, will retry"),
            }
        }
    }

    async fn hand_off(&self, raw: &RawLine, cancel: &CancellationToken) {
        let mut output = process_line(self.kind, raw, &self.normalizer);

        let request = match (&mut output, &self.delivery) {
            (
                PassOutput::Event {
                    event, request_id, ..
                },
                Some(_),
            ) => {
                let id = self.ids.next_id();
                *request_id = Some(id);
                Some(DeliveryRequest::PublishEvent {
                    id,
                    event: event.clone(),
                })
            }
            _ => None,
        };

        if self.outputs.send(output).await.is_err() {
            debug!("Presentation channel closed");
        }

        if let (Some(request), Some(delivery)) = (request, &self.delivery) {
            self.forward(delivery, request, cancel).await;
        }
    }

    /// Queue `request` for the delivery worker. Waiting for room stops at shutdown; a request
    /// that never reaches the queue is reported as abandoned like any other undelivered one.
    async fn forward(
        &self,
        delivery: &mpsc::Sender<DeliveryRequest>,
        request: DeliveryRequest,
        cancel: &CancellationToken,
    ) {
        let permit = tokio::select! {
            biased;
            permit = delivery.reserve() => permit.ok(),
            _ = cancel.cancelled() => None,
        };

        match permit {
            Some(permit) => permit.send(request),
            None => {
                warn!(request_id = %request.id(), "Delivery queue unavailable, event abandoned");
                report_outcome(
                    DeliveryOutcome::Abandoned { request },
                    self.dead_letter.as_ref(),
                    &self.outputs,
                )
                .await;
            }
        }
    }

    async fn report_error(&self, e: &TailError, fatal: bool) {
        let _ = self
            .outputs
            .send(PassOutput::SourceError {
                source: self.kind,
                message: e.to_string(),
                fatal,
            })
            .await;
    }
}

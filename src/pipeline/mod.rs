//! Wiring of the ingestion, processing and delivery stages.
//!
//! Each configured source gets its own ingestion task. Everything destined for presentation
//! flows through one bounded channel read by [`Pipeline::next_output`]; events from the log
//! source are also queued for the delivery worker.

pub mod delivery;
pub mod ingestion;
pub mod processing;
pub mod tasks;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::types::{CleanedLine, NormalizedEvent, RequestId, RequestIdGenerator, SourceKind};
use delivery::{
    AssetUpload, DeadLetterEntry, DeadLetterLog, DeliveryClient, DeliveryOutcome,
    DeliveryRequest, DeliveryWorker,
};
use ingestion::{DeviceCommand, DeviceError, DeviceLink};
use processing::Normalizer;
use tasks::IngestTask;

/// Everything the presentation layer is told about
#[derive(Debug)]
pub enum PassOutput {
    Text {
        source: SourceKind,
        line: CleanedLine,
    },
    Array {
        source: SourceKind,
        items: Vec<Value>,
    },
    Event {
        source: SourceKind,
        event: NormalizedEvent,
        /// Identity of the delivery request carrying this event, when forwarded
        request_id: Option<RequestId>,
    },
    Delivery(DeliveryOutcome),
    SourceError {
        source: SourceKind,
        message: String,
        fatal: bool,
    },
}

pub struct Pipeline {
    outputs: mpsc::Receiver<PassOutput>,
    delivery: Option<mpsc::Sender<DeliveryRequest>>,
    device: DeviceLink,
    ids: Arc<RequestIdGenerator>,
    dead_letter: Option<DeadLetterLog>,
    ingest_cancel: CancellationToken,
    abandon: CancellationToken,
    ingest_tasks: JoinSet<()>,
    worker: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl Pipeline {
    /// Start ingestion for every source in `config.sources` and the delivery worker.
    pub async fn start(config: &Config, client: DeliveryClient) -> Result<Self> {
        let sources = &config.sources;
        if sources.device_path.is_none() && sources.log_path.is_none() {
            return Err(BridgeError::Config("no sources configured".to_string()));
        }
        let normalizer = Arc::new(
            Normalizer::from_config(&config.normalize)
                .map_err(|e| BridgeError::Config(e.to_string()))?,
        );

        let (output_tx, output_rx) = mpsc::channel(config.channels.output_capacity);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.channels.delivery_capacity);
        let ids = Arc::new(RequestIdGenerator::new());
        let ingest_cancel = CancellationToken::new();
        let abandon = CancellationToken::new();

        let dead_letter = config
            .delivery
            .dead_letter_path
            .as_ref()
            .map(DeadLetterLog::new);
        let worker = DeliveryWorker::new(
            Arc::new(client),
            delivery_rx,
            output_tx.clone(),
            dead_letter.clone(),
        );
        let worker = tokio::spawn(worker.run(abandon.clone()));

        let mut ingest_tasks = JoinSet::new();
        let configured = [
            (SourceKind::Device, sources.device_path.clone()),
            (SourceKind::Log, sources.log_path.clone()),
        ];
        for (kind, path) in configured {
            let Some(path) = path else { continue };
            let task = IngestTask {
                kind,
                path,
                tail: config.tail.clone(),
                outputs: output_tx.clone(),
                delivery: (kind == SourceKind::Log).then(|| delivery_tx.clone()),
                normalizer: normalizer.clone(),
                ids: ids.clone(),
                dead_letter: dead_letter.clone(),
            };
            ingest_tasks.spawn(task.run(ingest_cancel.child_token()));
        }

        let device = match &sources.device_path {
            Some(path) => DeviceLink::connect(path).await,
            None => DeviceLink::disconnected("no device configured"),
        };

        info!(
            device = ?sources.device_path,
            log = ?sources.log_path,
            device_connected = device.is_connected(),
            "Pipeline started"
        );

        Ok(Self {
            outputs: output_rx,
            delivery: Some(delivery_tx),
            device,
            ids,
            dead_letter,
            ingest_cancel,
            abandon,
            ingest_tasks,
            worker: Some(worker),
            shutdown_grace: config.delivery.shutdown_grace(),
        })
    }

    /// Next item for presentation, in per-source order. `None` once every stage has stopped.
    pub async fn next_output(&mut self) -> Option<PassOutput> {
        self.outputs.recv().await
    }

    /// The dead-letter log shared with the delivery stages, when one is configured
    pub fn dead_letter(&self) -> Option<&DeadLetterLog> {
        self.dead_letter.as_ref()
    }

    pub fn device_connected(&self) -> bool {
        self.device.is_connected()
    }

    pub async fn send_command(&mut self, command: &DeviceCommand) -> std::result::Result<(), DeviceError> {
        self.device.send(command).await
    }

    /// Queue an asset upload. Never waits for room in the delivery queue.
    pub fn submit_asset(&self, asset: AssetUpload) -> Result<RequestId> {
        let id = self.ids.next_id();
        self.enqueue(DeliveryRequest::UploadAsset { id, asset })?;
        Ok(id)
    }

    /// Queue a dead-lettered entry again. `Ok(None)` when it cannot be rebuilt.
    pub async fn resubmit(&self, entry: &DeadLetterEntry) -> Result<Option<RequestId>> {
        let id = self.ids.next_id();
        match entry.to_request(id).await? {
            Some(request) => {
                self.enqueue(request)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn enqueue(&self, request: DeliveryRequest) -> Result<()> {
        let sender = self.delivery.as_ref().ok_or(BridgeError::ShuttingDown)?;
        sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => BridgeError::DeliveryBacklog,
            TrySendError::Closed(_) => BridgeError::ShuttingDown,
        })
    }

    /// Stop ingestion, let queued deliveries drain for the grace period, then abandon the
    /// rest. Returns every output produced while stopping, abandoned deliveries included.
    pub async fn shutdown(mut self) -> Vec<PassOutput> {
        info!("Pipeline shutting down");
        self.ingest_cancel.cancel();
        self.delivery.take();

        let mut remaining = Vec::new();
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        loop {
            tokio::select! {
                next = self.outputs.recv() => match next {
                    Some(output) => remaining.push(output),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !self.abandon.is_cancelled() => {
                    warn!(grace_ms = self.shutdown_grace.as_millis() as u64, "Shutdown grace expired, abandoning deliveries");
                    self.abandon.cancel();
                }
            }
        }

        while let Some(joined) = self.ingest_tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Ingestion task panicked");
            }
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Delivery worker panicked");
            }
        }

        info!(drained = remaining.len(), "Pipeline stopped");
        remaining
    }
}

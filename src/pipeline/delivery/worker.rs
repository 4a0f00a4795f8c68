use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{DeadLetterEntry, DeadLetterLog, DeliveryClient, DeliveryOutcome, DeliveryRequest};
use crate::metrics::delivery::DeliveryMetrics;
use crate::pipeline::PassOutput;

/// Drains the delivery queue one request at a time so ingestion never waits on the network
pub struct DeliveryWorker {
    client: Arc<DeliveryClient>,
    requests: mpsc::Receiver<DeliveryRequest>,
    outputs: mpsc::Sender<PassOutput>,
    dead_letter: Option<DeadLetterLog>,
}

impl DeliveryWorker {
    pub fn new(
        client: Arc<DeliveryClient>,
        requests: mpsc::Receiver<DeliveryRequest>,
        outputs: mpsc::Sender<PassOutput>,
        dead_letter: Option<DeadLetterLog>,
    ) -> Self {
        Self {
            client,
            requests,
            outputs,
            dead_letter,
        }
    }

    /// Run until every request sender is gone and the queue is empty, or until `abandon`
    /// fires. Whatever is still queued at that point is reported as abandoned.
    pub async fn run(mut self, abandon: CancellationToken) {
        info!("Delivery worker started");
        loop {
            let request = tokio::select! {
                biased;
                _ = abandon.cancelled() => break,
                next = self.requests.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            let outcome = self.client.deliver(request, &abandon).await;
            self.report(outcome).await;
        }

        self.requests.close();
        let mut abandoned = 0usize;
        while let Ok(request) = self.requests.try_recv() {
            abandoned += 1;
            self.report(DeliveryOutcome::Abandoned { request }).await;
        }
        if abandoned > 0 {
            warn!(abandoned, "Abandoned queued deliveries at shutdown");
        }
        info!("Delivery worker stopped");
    }

    async fn report(&self, outcome: DeliveryOutcome) {
        report_outcome(outcome, self.dead_letter.as_ref(), &self.outputs).await;
    }
}

/// Preserve an undelivered outcome in the dead-letter log, then tell presentation about it
pub(crate) async fn report_outcome(
    outcome: DeliveryOutcome,
    dead_letter: Option<&DeadLetterLog>,
    outputs: &mpsc::Sender<PassOutput>,
) {
    if let (Some(log), Some(entry)) = (dead_letter, DeadLetterEntry::from_outcome(&outcome)) {
        match log.append(&entry) {
            Ok(()) => DeliveryMetrics::record_dead_lettered(),
            Err(e) => error!(
                request_id = %entry.request_id,
                error = %e,
                "Failed to preserve undelivered request"
            ),
        }
    }

    if outputs.send(PassOutput::Delivery(outcome)).await.is_err() {
        warn!("Presentation channel closed, dropping delivery outcome");
    }
}

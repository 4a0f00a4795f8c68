//! Delivery Phase Metrics

use std::time::Duration;

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};
use crate::pipeline::delivery::DeliveryOutcome;

pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_attempt() {
        ::metrics::counter!(phase_metric!(counter, "delivery", "attempts")).increment(1);
    }

    pub fn record_retry() {
        ::metrics::counter!(phase_metric!(counter, "delivery", "retries")).increment(1);
    }

    pub fn record_dead_lettered() {
        ::metrics::counter!(phase_metric!(counter, "delivery", "dead_lettered")).increment(1);
    }

    /// Count the terminal outcome of one request and how long it took to reach it
    pub fn record_outcome(kind: &'static str, outcome: &DeliveryOutcome, elapsed: Duration) {
        let result = match outcome {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Failed { .. } => "failed",
            DeliveryOutcome::AssetStoredMetadataPending { .. } => "metadata_pending",
            DeliveryOutcome::Abandoned { .. } => "abandoned",
        };
        ::metrics::counter!(
            phase_metric!(counter, "delivery", "outcomes"),
            "kind" => kind,
            "result" => result
        )
        .increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "delivery", "duration_seconds"), "kind" => kind)
            .record(elapsed.as_secs_f64());
    }
}

impl PhaseMetrics for DeliveryMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "delivery", "attempts"));
        let _ = counter!(phase_metric!(counter, "delivery", "retries"));
        let _ = counter!(phase_metric!(counter, "delivery", "dead_lettered"));
        let _ = counter!(phase_metric!(counter, "delivery", "outcomes"));
        let _ = histogram!(phase_metric!(histogram, "delivery", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "delivery"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "delivery", "attempts"),
                metric_type: MetricType::Counter,
                help: "HTTP requests issued to the backend",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "delivery", "retries"),
                metric_type: MetricType::Counter,
                help: "Attempts that failed transiently and were retried",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "delivery", "dead_lettered"),
                metric_type: MetricType::Counter,
                help: "Undelivered requests preserved for resubmission",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "delivery", "outcomes"),
                metric_type: MetricType::Counter,
                help: "Terminal delivery outcomes",
                labels: vec!["kind", "result"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "delivery", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time from first attempt to terminal outcome",
                labels: vec!["kind"],
            },
        ]
    }
}

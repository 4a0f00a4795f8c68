//! Ingest Phase Metrics
//!
//! Line throughput per source, cleanup and extraction hit rates, normalization results.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};
use crate::types::SourceKind;

pub struct IngestMetrics;

impl IngestMetrics {
    pub fn record_line_read(source: SourceKind) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "lines_read"), "source" => source.to_string())
            .increment(1);
    }

    /// A line had control sequences removed or spans closed
    pub fn record_line_cleaned(source: SourceKind) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "lines_cleaned"), "source" => source.to_string())
            .increment(1);
    }

    pub fn record_record_extracted(source: SourceKind) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "records_extracted"), "source" => source.to_string())
            .increment(1);
    }

    pub fn record_malformed_fragment() {
        ::metrics::counter!(phase_metric!(counter, "ingest", "malformed_fragments")).increment(1);
    }

    pub fn record_event_normalized() {
        ::metrics::counter!(phase_metric!(counter, "ingest", "events_normalized")).increment(1);
    }

    pub fn record_normalize_error() {
        ::metrics::counter!(phase_metric!(counter, "ingest", "normalize_errors")).increment(1);
    }

    pub fn record_source_error(source: SourceKind, fatal: bool) {
        ::metrics::counter!(
            phase_metric!(counter, "ingest", "source_errors"),
            "source" => source.to_string(),
            "fatal" => fatal.to_string()
        )
        .increment(1);
    }
}

impl PhaseMetrics for IngestMetrics {
    fn register_metrics() {
        use metrics::counter;

        let _ = counter!(phase_metric!(counter, "ingest", "lines_read"));
        let _ = counter!(phase_metric!(counter, "ingest", "lines_cleaned"));
        let _ = counter!(phase_metric!(counter, "ingest", "records_extracted"));
        let _ = counter!(phase_metric!(counter, "ingest", "malformed_fragments"));
        let _ = counter!(phase_metric!(counter, "ingest", "events_normalized"));
        let _ = counter!(phase_metric!(counter, "ingest", "normalize_errors"));
        let _ = counter!(phase_metric!(counter, "ingest", "source_errors"));
    }

    fn phase_name() -> &'static str {
        "ingest"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "ingest", "lines_read"),
                metric_type: MetricType::Counter,
                help: "Complete lines read from a source",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "lines_cleaned"),
                metric_type: MetricType::Counter,
                help: "Lines that needed terminal sequence cleanup",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "records_extracted"),
                metric_type: MetricType::Counter,
                help: "Lines carrying a well-formed JSON object or array",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "malformed_fragments"),
                metric_type: MetricType::Counter,
                help: "Balanced bracket fragments that failed to parse",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "events_normalized"),
                metric_type: MetricType::Counter,
                help: "Status records normalized into events",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "normalize_errors"),
                metric_type: MetricType::Counter,
                help: "Status records rejected by the normalizer",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "source_errors"),
                metric_type: MetricType::Counter,
                help: "Open and read failures per source",
                labels: vec!["source", "fatal"],
            },
        ]
    }
}

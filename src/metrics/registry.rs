//! Registration of every phase's metrics with conflict detection

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::ingest::IngestMetrics>(&mut all_metrics);
    register_phase_metrics::<super::delivery::DeliveryMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );
}

fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<&'static str, MetricDoc>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        if extract_phase_from_metric_name(doc.name) != phase_name {
            warn!(
                "Metric '{}' does not carry the prefix of phase '{}'",
                doc.name, phase_name
            );
        }
        if all_metrics.contains_key(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' registered twice (phase '{}')",
                doc.name, phase_name
            );
            continue;
        }
        debug!(name = doc.name, kind = ?doc.metric_type, labels = ?doc.labels, "{}", doc.help);
        all_metrics.insert(doc.name, doc);
    }
}

/// "sensor_bridge_ingest_lines_read_total" -> "ingest"
fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    metric_name
        .strip_prefix("sensor_bridge_")
        .and_then(|rest| rest.split('_').next())
        .unwrap_or("unknown")
}

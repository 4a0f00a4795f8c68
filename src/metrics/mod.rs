//! Phase-organized metrics for the bridge
//!
//! Each pipeline phase defines its metrics in a dedicated submodule. Without a configured
//! listen address no recorder is installed and every metric call is a no-op.

pub mod delivery;
pub mod ingest;
pub mod registry;

pub use delivery::DeliveryMetrics;
pub use ingest::IngestMetrics;

use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

use crate::config::MetricsConfig;
use crate::constants::METRICS_ADDR_ENV;

static INIT: Once = Once::new();

/// Install the Prometheus exporter when an address is configured. Idempotent.
pub fn init_metrics(config: &MetricsConfig) {
    INIT.call_once(|| {
        let addr_str = match config
            .listen_addr
            .clone()
            .or_else(|| std::env::var(METRICS_ADDR_ENV).ok())
            .filter(|s| !s.trim().is_empty())
        {
            Some(addr) => addr,
            None => {
                info!("No metrics address configured, Prometheus exporter disabled");
                return;
            }
        };

        let addr: SocketAddr = match addr_str.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid metrics addr '{}': {}", addr_str, e);
                return;
            }
        };

        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => {
                info!("Prometheus HTTP exporter started at http://{}/metrics", addr);
                registry::register_all_metrics();
            }
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    });
}

/// Implemented by each phase's metrics collection
pub trait PhaseMetrics {
    /// Pre-register every metric so it is exported before its first increment
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Metric names follow sensor_bridge_{phase}_{metric_name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("sensor_bridge_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("sensor_bridge_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("sensor_bridge_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

use thiserror::Error;

use crate::pipeline::delivery::DeliveryError;
use crate::pipeline::ingestion::device::DeviceError;
use crate::pipeline::ingestion::tailer::TailError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error: {0}")]
    Source(#[from] TailError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Delivery queue is full, try again shortly")]
    DeliveryBacklog,

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

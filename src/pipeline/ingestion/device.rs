//! Outbound half of the interactive serial channel.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device is not connected: {reason}")]
    Disconnected { reason: String },

    #[error("write to {} failed: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Sensor whose alarm threshold can be tuned from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSensor {
    Ultrasonic,
    Magnetometer,
}

impl ThresholdSensor {
    /// Single-letter code the firmware shell expects
    pub fn code(&self) -> char {
        match self {
            ThresholdSensor::Ultrasonic => 'u',
            ThresholdSensor::Magnetometer => 'm',
        }
    }
}

impl FromStr for ThresholdSensor {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u" | "ultrasonic" => Ok(ThresholdSensor::Ultrasonic),
            "m" | "mag" | "magnetometer" => Ok(ThresholdSensor::Magnetometer),
            other => Err(DeviceError::InvalidCommand(format!(
                "unknown sensor '{other}', expected u or m"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Text forwarded verbatim; the firmware shell does its own validation
    Raw(String),
    Threshold { sensor: ThresholdSensor, value: f64 },
}

impl DeviceCommand {
    pub fn threshold(sensor: ThresholdSensor, value: f64) -> Result<Self, DeviceError> {
        if !value.is_finite() {
            return Err(DeviceError::InvalidCommand(format!(
                "threshold must be a finite number, got {value}"
            )));
        }
        Ok(DeviceCommand::Threshold { sensor, value })
    }

    /// Newline-terminated bytes written to the device
    pub fn to_wire(&self) -> String {
        match self {
            DeviceCommand::Raw(text) => format!("{text}\n"),
            DeviceCommand::Threshold { sensor, value } => {
                format!("sensor {} {:.3}\n", sensor.code(), value)
            }
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire().trim_end())
    }
}

/// Writable handle to the device, or the reason there is none
#[derive(Debug)]
pub enum DeviceLink {
    Connected { path: PathBuf, writer: File },
    Disconnected { reason: String },
}

impl DeviceLink {
    /// Open `path` for writing. Failure yields a disconnected link rather than an error so
    /// log ingestion can run without hardware attached.
    pub async fn connect(path: &Path) -> Self {
        match OpenOptions::new().append(true).open(path).await {
            Ok(writer) => {
                info!(path = %path.display(), "Device link connected");
                DeviceLink::Connected {
                    path: path.to_path_buf(),
                    writer,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Device unavailable");
                DeviceLink::Disconnected {
                    reason: format!("{}: {}", path.display(), e),
                }
            }
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        DeviceLink::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceLink::Connected { .. })
    }

    /// Write one command. A failed write drops the link into the disconnected state.
    pub async fn send(&mut self, command: &DeviceCommand) -> Result<(), DeviceError> {
        let (path, writer) = match self {
            DeviceLink::Connected { path, writer } => (path, writer),
            DeviceLink::Disconnected { reason } => {
                return Err(DeviceError::Disconnected {
                    reason: reason.clone(),
                })
            }
        };

        let wire = command.to_wire();
        let written = async {
            writer.write_all(wire.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                debug!(command = %command, "Sent device command");
                Ok(())
            }
            Err(source) => {
                let path = path.clone();
                *self = DeviceLink::Disconnected {
                    reason: format!("write failed: {source}"),
                };
                Err(DeviceError::Write { path, source })
            }
        }
    }
}

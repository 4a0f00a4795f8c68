pub mod device;
pub mod tailer;

pub use device::{DeviceCommand, DeviceError, DeviceLink, ThresholdSensor};
pub use tailer::{LinePoll, TailError, Tailer};

//! Line-oriented terminal front end: renders pipeline output and parses operator input.

use std::path::PathBuf;

use crate::constants::{SPAN_END, SPAN_START};
use crate::pipeline::ingestion::{DeviceCommand, DeviceError, ThresholdSensor};
use crate::pipeline::PassOutput;

const HIGHLIGHT_ON: &str = "\x1b[1;32m";
const HIGHLIGHT_OFF: &str = "\x1b[0m";

/// What the operator asked for on one input line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Device(DeviceCommand),
    Upload(PathBuf),
    /// Queue everything in the dead-letter log again
    Resubmit,
    Quit,
    Help,
}

pub const HELP: &str = "\
:upload <file>               upload an image and publish its metadata
:threshold <u|m> <value>     set the ultrasonic or magnetometer alarm threshold
:resubmit                    retry deliveries preserved in the dead-letter log
:quit                        stop the bridge
anything else                sent verbatim to the device";

/// Parse an operator line. Lines not starting with `:` go to the device unchanged.
pub fn parse_command(line: &str) -> Result<ConsoleCommand, DeviceError> {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix(':') else {
        return Ok(ConsoleCommand::Device(DeviceCommand::Raw(
            line.trim_end_matches(['\r', '\n']).to_string(),
        )));
    };

    let mut parts = rest.split_whitespace();
    match parts.next() {
        Some("quit") | Some("q") => Ok(ConsoleCommand::Quit),
        Some("help") | Some("h") => Ok(ConsoleCommand::Help),
        Some("resubmit") => Ok(ConsoleCommand::Resubmit),
        Some("upload") => {
            let path = rest
                .trim_start()
                .strip_prefix("upload")
                .unwrap_or_default()
                .trim();
            if path.is_empty() {
                return Err(DeviceError::InvalidCommand("usage: :upload <file>".into()));
            }
            Ok(ConsoleCommand::Upload(PathBuf::from(path)))
        }
        Some("threshold") => {
            let (Some(sensor), Some(value), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(DeviceError::InvalidCommand(
                    "usage: :threshold <u|m> <value>".into(),
                ));
            };
            let sensor: ThresholdSensor = sensor.parse()?;
            let value: f64 = value.parse().map_err(|_| {
                DeviceError::InvalidCommand(format!("'{value}' is not a number"))
            })?;
            Ok(ConsoleCommand::Device(DeviceCommand::threshold(sensor, value)?))
        }
        Some(other) => Err(DeviceError::InvalidCommand(format!(
            "unknown command ':{other}', try :help"
        ))),
        None => Err(DeviceError::InvalidCommand("empty command".into())),
    }
}

/// Terminal rendering of one pipeline output. Span markers become terminal highlighting
/// when `color` is set and are removed otherwise.
pub fn render(output: &PassOutput, color: bool) -> String {
    match output {
        PassOutput::Text { source, line } => {
            format!("[{source}] {}", render_spans(&line.text, color))
        }
        PassOutput::Array { source, items } => {
            let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
            format!("[{source}] [{}]", items.join(", "))
        }
        PassOutput::Event {
            source,
            event,
            request_id,
        } => match request_id {
            Some(id) => format!("[{source}] event {event} -> {id}"),
            None => format!("[{source}] event {event}"),
        },
        PassOutput::Delivery(outcome) => format!("[delivery] {outcome}"),
        PassOutput::SourceError {
            source,
            message,
            fatal,
        } => {
            let severity = if *fatal { "stopped" } else { "error" };
            format!("[{source}] {severity}: {message}")
        }
    }
}

fn render_spans(text: &str, color: bool) -> String {
    let (on, off) = if color {
        (HIGHLIGHT_ON, HIGHLIGHT_OFF)
    } else {
        ("", "")
    };
    text.replace(SPAN_START, on).replace(SPAN_END, off)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::clean;
    use crate::types::SourceKind;

    #[test]
    fn test_plain_lines_go_to_device() {
        assert_eq!(
            parse_command("blockchain print\n").unwrap(),
            ConsoleCommand::Device(DeviceCommand::Raw("blockchain print".into()))
        );
    }

    #[test]
    fn test_threshold_command() {
        assert_eq!(
            parse_command(":threshold u 1.25").unwrap(),
            ConsoleCommand::Device(DeviceCommand::Threshold {
                sensor: ThresholdSensor::Ultrasonic,
                value: 1.25
            })
        );
        assert!(parse_command(":threshold u").is_err());
        assert!(parse_command(":threshold x 1").is_err());
        assert!(parse_command(":threshold m abc").is_err());
    }

    #[test]
    fn test_upload_keeps_spaces_in_path() {
        assert_eq!(
            parse_command(":upload captures/front door.jpg").unwrap(),
            ConsoleCommand::Upload(PathBuf::from("captures/front door.jpg"))
        );
        assert!(parse_command(":upload").is_err());
    }

    #[test]
    fn test_quit_and_unknown() {
        assert_eq!(parse_command(":quit").unwrap(), ConsoleCommand::Quit);
        assert_eq!(parse_command(" :resubmit ").unwrap(), ConsoleCommand::Resubmit);
        assert!(parse_command(":frobnicate").is_err());
    }

    #[test]
    fn test_render_text_without_color() {
        let output = PassOutput::Text {
            source: SourceKind::Device,
            line: clean("\x1b[1;32muart:~$ \x1b[0m"),
        };
        assert_eq!(render(&output, false), "[device] uart:~$ ");
        assert_eq!(
            render(&output, true),
            "[device] \x1b[1;32muart:~$ \x1b[0m"
        );
    }
}

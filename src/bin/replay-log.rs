use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use sensor_bridge::config::Config;
use sensor_bridge::pipeline::processing::{clean, extract, Normalizer};
use sensor_bridge::types::CandidateRecord;

/// Show what the live pipeline would recover from a captured log, from its first line.
#[derive(Parser, Debug)]
#[command(name = "replay-log", version, about = "Replay a captured device log through cleanup, extraction and normalization")]
struct Cli {
    /// Captured log, e.g. RTT.log
    path: PathBuf,

    /// Configuration file supplying normalization rules
    #[arg(long, default_value = "sensor_bridge.toml")]
    config: PathBuf,

    /// Print only lines that produced a normalized event
    #[arg(long)]
    events_only: bool,
}

#[derive(Default)]
struct Tally {
    lines: usize,
    cleaned: usize,
    records: usize,
    events: usize,
    rejected: usize,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let normalizer = Normalizer::from_config(&config.normalize)
        .context("Invalid normalization rules")?;

    let file = File::open(&args.path)
        .with_context(|| format!("Failed to open {}", args.path.display()))?;

    let mut tally = Tally::default();
    for (lineno, bytes) in BufReader::new(file).split(b'\n').enumerate() {
        let bytes = bytes.with_context(|| format!("Failed to read {}", args.path.display()))?;
        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            continue;
        }
        tally.lines += 1;

        let line = clean(text);
        if line.modified {
            tally.cleaned += 1;
        }
        let n = lineno + 1;

        match extract(&line.text) {
            None => {
                if !args.events_only {
                    println!("{n:>6} text   {}", line.text);
                }
            }
            Some(CandidateRecord::Array(items)) => {
                tally.records += 1;
                if !args.events_only {
                    println!("{n:>6} array  {}", serde_json::Value::Array(items));
                }
            }
            Some(record) => {
                tally.records += 1;
                match normalizer.normalize(&record) {
                    Ok(event) => {
                        tally.events += 1;
                        println!("{n:>6} event  {event}");
                    }
                    Err(e) => {
                        tally.rejected += 1;
                        if !args.events_only {
                            println!("{n:>6} reject {e}: {}", record.into_value());
                        }
                    }
                }
            }
        }
    }

    eprintln!(
        "{} lines, {} needed cleanup, {} records, {} events, {} rejected",
        tally.lines, tally.cleaned, tally.records, tally.events, tally.rejected
    );
    Ok(())
}

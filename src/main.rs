use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sensor_bridge::config::Config;
use sensor_bridge::console::{self, ConsoleCommand};
use sensor_bridge::infra::http_client::ReqwestTransport;
use sensor_bridge::pipeline::delivery::{
    dead_letter, AssetUpload, Credentials, DeadLetterEntry, DeadLetterLog, DeliveryClient,
    DeliveryRequest,
};
use sensor_bridge::pipeline::Pipeline;
use sensor_bridge::types::RequestIdGenerator;
use sensor_bridge::{logging, metrics};

#[derive(Parser)]
#[command(name = "sensor_bridge")]
#[command(about = "Forward base station status events and images to the telemetry backend")]
#[command(version)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "sensor_bridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the device and its log, forward events, and take operator input on stdin
    Run {
        /// Serial device to talk to
        #[arg(long)]
        device: Option<PathBuf>,
        /// Debug log mirrored by the RTT viewer
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run without the serial device
        #[arg(long)]
        no_device: bool,
        /// Never emit terminal colors
        #[arg(long)]
        no_color: bool,
    },
    /// Upload one image and publish its metadata event
    Upload {
        file: PathBuf,
    },
    /// Retry everything preserved in the dead-letter log
    Resubmit,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: failed to load {}: {e}", cli.config.display());
            std::process::exit(2);
        }
    };
    let guard = logging::init_logging(&config.logging);
    metrics::init_metrics(&config.metrics);

    let result = match cli.command {
        Commands::Run {
            device,
            log,
            no_device,
            no_color,
        } => {
            let color = !no_color && std::io::stdout().is_terminal();
            run(config, device, log, no_device, color).await
        }
        Commands::Upload { file } => upload(&config, file).await,
        Commands::Resubmit => resubmit(&config).await,
    };

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {e:#}");
            1
        }
    };
    drop(guard);
    // A blocking read on a quiet serial port would otherwise hold the runtime open
    std::process::exit(code);
}

fn build_client(config: &Config) -> Result<DeliveryClient> {
    let transport = ReqwestTransport::new(config.delivery.request_timeout())
        .context("Failed to build HTTP client")?;
    let credentials = Credentials::from_env()?;
    let client = DeliveryClient::new(&config.delivery, credentials, Arc::new(transport))?;
    Ok(client)
}

/// Cancelled on Ctrl-C so in-flight retries stop promptly
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    token
}

async fn run(
    mut config: Config,
    device: Option<PathBuf>,
    log: Option<PathBuf>,
    no_device: bool,
    color: bool,
) -> Result<()> {
    if device.is_some() {
        config.sources.device_path = device;
    }
    if log.is_some() {
        config.sources.log_path = log;
    }
    config.sources = config.sources.or_defaults();
    if no_device {
        config.sources.device_path = None;
    }

    let client = build_client(&config)?;
    let mut pipeline = Pipeline::start(&config, client).await?;
    let dead_letter = pipeline.dead_letter().cloned();
    if !pipeline.device_connected() {
        println!("[device] not connected, commands will be refused");
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let interrupted = interrupt_token();

    loop {
        tokio::select! {
            output = pipeline.next_output() => match output {
                Some(output) => println!("{}", console::render(&output, color)),
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_input(&mut pipeline, dead_letter.as_ref(), &line).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed, continuing without operator input");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
            _ = interrupted.cancelled() => {
                info!("Interrupted");
                break;
            }
        }
    }

    for output in pipeline.shutdown().await {
        println!("{}", console::render(&output, color));
    }
    Ok(())
}

/// Act on one operator line; false means stop
async fn handle_input(
    pipeline: &mut Pipeline,
    dead_letter: Option<&DeadLetterLog>,
    line: &str,
) -> bool {
    if line.trim().is_empty() {
        return true;
    }

    match console::parse_command(line) {
        Ok(ConsoleCommand::Quit) => return false,
        Ok(ConsoleCommand::Help) => println!("{}", console::HELP),
        Ok(ConsoleCommand::Device(command)) => {
            if let Err(e) = pipeline.send_command(&command).await {
                println!("[device] {e}");
            }
        }
        Ok(ConsoleCommand::Upload(path)) => match AssetUpload::from_file(&path).await {
            Ok(asset) => match pipeline.submit_asset(asset) {
                Ok(id) => println!("[delivery] queued {id} for {}", path.display()),
                Err(e) => println!("[delivery] {e}"),
            },
            Err(e) => println!("[delivery] cannot read {}: {e}", path.display()),
        },
        Ok(ConsoleCommand::Resubmit) => match dead_letter {
            Some(log) => requeue_dead_letters(pipeline, log).await,
            None => println!("[delivery] no dead-letter log configured"),
        },
        Err(e) => println!("{e}"),
    }
    true
}

/// Move dead-lettered entries back onto the live delivery queue. Entries that fail again are
/// re-recorded by the delivery worker.
async fn requeue_dead_letters(pipeline: &Pipeline, log: &DeadLetterLog) {
    let entries = match log.take_all() {
        Ok(entries) => entries,
        Err(e) => {
            println!("[delivery] cannot drain dead-letter log: {e}");
            return;
        }
    };

    let mut kept = 0usize;
    let mut queued = 0usize;
    for entry in entries {
        let requeued = match pipeline.resubmit(&entry).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(request_id = %entry.request_id, error = %e, "Could not requeue entry");
                false
            }
        };
        if requeued {
            queued += 1;
            continue;
        }
        kept += 1;
        if let Err(e) = log.append(&entry) {
            error!(request_id = %entry.request_id, error = %e, "Lost dead-letter entry while requeueing");
        }
    }

    println!("[delivery] requeued {queued}, {kept} left in the dead-letter log");
}

async fn upload(config: &Config, file: PathBuf) -> Result<()> {
    let client = build_client(config)?;
    let asset = AssetUpload::from_file(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let ids = RequestIdGenerator::new();

    let outcome = client
        .deliver(
            DeliveryRequest::UploadAsset {
                id: ids.next_id(),
                asset,
            },
            &interrupt_token(),
        )
        .await;
    println!("{outcome}");

    if let Some(entry) = DeadLetterEntry::from_outcome(&outcome) {
        if let Some(path) = &config.delivery.dead_letter_path {
            DeadLetterLog::new(path)
                .append(&entry)
                .context("Failed to record undelivered upload")?;
            println!("preserved in {} for resubmission", path.display());
        }
        anyhow::bail!("upload did not complete");
    }
    Ok(())
}

async fn resubmit(config: &Config) -> Result<()> {
    let path = config
        .delivery
        .dead_letter_path
        .as_ref()
        .context("delivery.dead_letter_path is not configured")?;
    let client = build_client(config)?;
    let log = DeadLetterLog::new(path);
    let ids = RequestIdGenerator::new();

    let outcomes = dead_letter::resubmit_all(&client, &log, &ids, &interrupt_token()).await?;
    for outcome in &outcomes {
        println!("{outcome}");
    }
    let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
    println!("{delivered}/{} resubmitted deliveries completed", outcomes.len());
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use voxloop_core::config::{Config, GatewayConfig};
use voxloop_core::session::SessionId;
use voxloop_core::types::{AudioContainer, FormatRequest};
use voxloop_gateway::GatewayState;
use voxloop_pipeline::PipelineController;

/// Chunk size used when feeding a file through the pipeline (100 ms at 16 kHz mono 16-bit).
const TURN_CHUNK_BYTES: usize = 3200;

#[derive(Parser)]
#[command(
    name = "voxloop",
    about = "Voice assistant turn pipeline: record, transcribe, reply, speak",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on (default: 5000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one full turn on a recorded WAV file
    Turn {
        /// Recorded speech
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the spoken reply
        #[arg(short, long, default_value = "reply.wav")]
        output: PathBuf,

        /// Output sample rate (default: the synthesizer's)
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Output channel count (default: the synthesizer's)
        #[arg(long)]
        channels: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and whether a gateway is running
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let logging = config.logging.clone().unwrap_or_default();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = if verbose {
                "debug"
            } else {
                logging.level.as_deref().unwrap_or("info")
            };
            let mut filter = EnvFilter::new(level);
            for directive in &logging.filters {
                filter = filter.add_directive(
                    directive
                        .parse()
                        .with_context(|| format!("Invalid log filter '{directive}'"))?,
                );
            }
            filter
        }
    };

    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            if let Some(bind) = bind {
                config
                    .gateway
                    .get_or_insert_with(|| GatewayConfig {
                        port,
                        bind: None,
                        default_session: None,
                    })
                    .bind = Some(bind);
            }
            serve(config, port).await?;
        }
        Commands::Turn {
            input,
            output,
            sample_rate,
            channels,
        } => {
            let request = FormatRequest {
                sample_rate,
                channels,
                sample_width: None,
                container: Some(AudioContainer::Wav),
            };
            run_turn(&config, &input, &output, request).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK ({})", config_path.display());
            }
        },
        Commands::Status => status(&config, &config_path).await,
    }

    Ok(())
}

async fn serve(config: Config, port: u16) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        bail!("Invalid configuration: {}", errors.join("; "));
    }

    let pipeline = PipelineController::from_config(&config)?;
    let state = GatewayState::new(Arc::new(config), Arc::new(pipeline));

    #[cfg(feature = "metrics")]
    let state = state.with_metrics(voxloop_gateway::metrics::install_prometheus_recorder()?);

    tracing::info!("Starting voxloop gateway on port {port}");
    voxloop_gateway::start_gateway(Arc::new(state), port).await
}

async fn run_turn(
    config: &Config,
    input: &Path,
    output: &Path,
    request: FormatRequest,
) -> anyhow::Result<()> {
    let audio = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    if audio.is_empty() {
        bail!("{} is empty", input.display());
    }

    let pipeline = PipelineController::from_config(config)?;
    let id = pipeline.start_session(Some(SessionId::new("cli"))).await;

    for chunk in audio.chunks(TURN_CHUNK_BYTES) {
        pipeline.upload_chunk(&id, chunk).await?;
    }

    let transcript = pipeline.finalize_and_transcribe(&id).await?;
    println!("you:       {transcript}");

    let reply = pipeline.advance_dialogue(&id).await?;
    println!("assistant: {reply}");

    let speech = pipeline.synthesize_reply(&id, request).await?;
    std::fs::write(output, &speech.data)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} ({} bytes, {} Hz, {} ch)",
        output.display(),
        speech.data.len(),
        speech.format.sample_rate,
        speech.format.channels,
    );

    pipeline.teardown(&id).await?;
    Ok(())
}

async fn status(config: &Config, config_path: &Path) {
    let port = config.gateway_port();
    println!("voxloop v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Gateway: {}:{}", config.gateway_bind(), port);
    println!(
        "Transcription: {}",
        config.transcription.clone().unwrap_or_default().provider
    );
    println!("Responder: {}", config.responder.clone().unwrap_or_default().provider);
    println!("TTS: {}", config.tts.clone().unwrap_or_default().provider);
    match config.cache_dir() {
        Some(dir) => println!("Cache: {}", dir.display()),
        None => println!("Cache: disabled"),
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();
    let health = match client {
        Ok(client) => client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .ok(),
        Err(_) => None,
    };
    match health {
        Some(resp) if resp.status().is_success() => {
            let sessions = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["sessions"].as_u64())
                .unwrap_or(0);
            println!("Status: running ({sessions} sessions)");
        }
        _ => println!("Status: not running"),
    }
}

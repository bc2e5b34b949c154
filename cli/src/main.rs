use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use redraft_core::{load_config, InputSource, Orchestrator, StaticSource};
use redraft_observability::init_logging;
use redraft_providers::OllamaBackend;
use redraft_types::{builtin_modes, combined_report, EngineEvent, TaskStatus};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "redraft")]
#[command(about = "Run drafting modes over the clipboard text via a local generation endpoint")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every mode over the shared input text and print the results.
    Run {
        /// Input text; defaults to the clipboard contents.
        #[arg(long)]
        text: Option<String>,
        /// Read the input text from stdin instead of the clipboard.
        #[arg(long, default_value_t = false)]
        stdin: bool,
        /// Path to a config file (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Consolidate the mode outputs with a final refine pass.
        #[arg(long, default_value_t = false)]
        refine: bool,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List the built-in modes.
    Modes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run {
        text: None,
        stdin: false,
        config: None,
        refine: false,
        endpoint: None,
        model: None,
    }) {
        Command::Run {
            text,
            stdin,
            config,
            refine,
            endpoint,
            model,
        } => run(text, stdin, config, refine, endpoint, model).await,
        Command::Modes => {
            for mode in builtin_modes() {
                println!("{:<16} {}", mode.name, mode.instruction);
            }
            Ok(())
        }
    }
}

async fn run(
    text: Option<String>,
    stdin: bool,
    config_path: Option<PathBuf>,
    refine: bool,
    endpoint: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let logs_dir = default_logs_dir();
    let (_log_guard, log_info) = init_logging(&logs_dir, LOG_RETENTION_DAYS)?;
    info!(logs_dir = %log_info.logs_dir, "logging initialized");

    let mut config = load_config(config_path.as_deref())?;
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Some(model) = model {
        config.model = model;
    }

    let input: Arc<dyn InputSource> = if let Some(text) = text {
        Arc::new(StaticSource::new(text))
    } else if stdin {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        Arc::new(StaticSource::new(buffer))
    } else {
        Arc::new(ClipboardSource)
    };

    let backend = OllamaBackend::new(config.backend_config())?;
    let modes = builtin_modes();
    let mode_count = modes.len();
    let handle = Orchestrator::spawn(modes, Arc::new(backend), input, config.max_concurrent);
    let mut events = handle.subscribe();
    handle.run_all().await?;

    let mut finished: HashSet<String> = HashSet::new();
    loop {
        match events.recv().await {
            Ok(EngineEvent::Notice { message }) => {
                println!("{message}");
                return Ok(());
            }
            Ok(EngineEvent::ModeError { mode, message }) => {
                eprintln!("{mode}: {message}");
            }
            Ok(EngineEvent::ModeFinished { mode }) => {
                eprintln!("done: {mode}");
                finished.insert(mode);
                if finished.len() == mode_count {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event consumer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    let snapshot = handle.snapshot().await?;
    let report = combined_report(&snapshot);
    println!("{report}");

    if refine && snapshot.iter().any(|r| r.status == TaskStatus::Done) {
        handle.refine(report).await?;
        let mut refined = String::new();
        loop {
            match events.recv().await {
                Ok(EngineEvent::RefineChunk { text }) => refined.push_str(&text),
                Ok(EngineEvent::RefineError { message }) => {
                    eprintln!("refine failed: {message}");
                }
                Ok(EngineEvent::RefineFinished) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event consumer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        if !refined.trim().is_empty() {
            println!("\n## Refined Result\n{}", refined.trim());
        }
    }

    handle.shutdown().await.ok();
    Ok(())
}

struct ClipboardSource;

impl InputSource for ClipboardSource {
    fn read(&self) -> anyhow::Result<String> {
        let mut clipboard = arboard::Clipboard::new().context("failed to open clipboard")?;
        match clipboard.get_text() {
            Ok(text) => Ok(text),
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            Err(err) => Err(err).context("failed to read clipboard text"),
        }
    }
}

fn default_logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("redraft").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

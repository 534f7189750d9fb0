//! Command-line front end for the Quill orchestration layer
//!
//! Usage:
//! ```bash
//! quill status
//! quill models
//! quill process --task investigation-summary "Echo: LVEF 55%, mild MR"
//! quill process --task tavi --stream --system "You write TAVI reports." "$(cat dictation.txt)"
//! quill transcribe dictation.webm
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;

use quill::health::SubsystemStatus;
use quill::llm::ChatBackend;
use quill::orchestrator::ProgressUpdate;
use quill::telemetry::{init_logging, LoggingConfig};
use quill::transcription::TranscriptionClient;
use quill::{
    CallerContext, CancellationToken, Messages, Orchestrator, QuillConfig, QuillError, TaskRequest,
};

#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(about = "Local-inference orchestration for clinical dictation")]
struct Cli {
    /// Configuration file (.toml, .yaml, .yml or .json); QUILL_* variables still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Console log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe every local server and print the connection snapshot
    Status,
    /// List models served by the inference server
    Models,
    /// Process a prompt for a task
    Process {
        /// Task id, e.g. tavi, quick-letter, investigation-summary
        #[arg(long)]
        task: String,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        /// Print deltas as they arrive
        #[arg(long)]
        stream: bool,

        /// Show attempts, backoff and fallback on stderr
        #[arg(long)]
        verbose: bool,

        /// User prompt
        prompt: String,
    },
    /// Transcribe an audio file
    Transcribe {
        /// Audio file to upload
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig::from_env().with_console_level(cli.log_level.clone());
    let _guard = init_logging(logging).context("failed to initialise logging")?;

    let config = QuillConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Status => status(&config).await,
        Command::Models => models(&config).await,
        Command::Process {
            task,
            system,
            stream,
            verbose,
            prompt,
        } => process(&config, task, system, stream, verbose, prompt).await,
        Command::Transcribe { file } => transcribe(&config, file).await,
    }
}

async fn status(config: &QuillConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let status = orchestrator.monitor().refresh().await;

    let headline = if status.is_connected {
        "connected".green().bold()
    } else {
        "disconnected".red().bold()
    };
    println!("{} {}", "Inference server:".bold(), headline);
    if let Some(latency) = status.latency_ms {
        println!("  {}", format!("latency {}ms", latency).dimmed());
    }
    print_subsystem("inference", &status.inference);
    print_subsystem("transcription", &status.transcription);
    print_subsystem("optimization", &status.optimization);
    Ok(())
}

fn print_subsystem(name: &str, status: &SubsystemStatus) {
    let state = match (status.running, status.ready) {
        (true, true) => "ready".green(),
        (true, false) => "running, not ready".yellow(),
        _ => "not running".red(),
    };
    let port = status
        .port
        .map(|p| format!(" (port {})", p))
        .unwrap_or_default();
    println!("  {:<14} {}{}", name, state, port.dimmed());
    if let Some(error) = &status.error {
        println!("  {:<14} {}", "", error.dimmed());
    }
}

async fn models(config: &QuillConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let models = orchestrator.inference().available_models().await?;
    if models.is_empty() {
        println!("{}", "No models loaded".yellow());
    }
    for model in models {
        println!("{}", model);
    }
    Ok(())
}

async fn process(
    config: &QuillConfig,
    task: String,
    system: Option<String>,
    stream: bool,
    verbose: bool,
    prompt: String,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    if !orchestrator.profiles().contains(&task) {
        eprintln!(
            "{}",
            format!("Unknown task '{}', using the default profile", task).yellow()
        );
    }

    let messages = match system {
        Some(system) => Messages::from_prompt(&system, &prompt),
        None => Messages::from(vec![quill::Message::user(prompt)]),
    };

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut context = CallerContext::new().with_cancel(stop);
    if stream {
        context = context.on_token(|delta| {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        });
    }
    if verbose {
        context.on_progress = Some(Arc::new(|update: &ProgressUpdate| {
            eprintln!("{}", format!("{:?}", update).dimmed());
        }));
    }

    match orchestrator
        .process(TaskRequest::new(task, messages).streaming(stream), &context)
        .await
    {
        Ok(outcome) => {
            if stream {
                println!();
            } else {
                println!("{}", outcome.content);
            }
            let mut summary = format!(
                "served by {} ({}) in {:.1}s",
                outcome.served_by,
                outcome.model,
                outcome.duration.as_secs_f64()
            );
            if let Some(reason) = &outcome.fallback_reason {
                summary.push_str(&format!(", after fallback: {}", reason));
            }
            eprintln!("{}", summary.dimmed());
            Ok(())
        }
        Err(QuillError::Cancelled) => {
            eprintln!("\n{}", "Cancelled".yellow());
            Ok(())
        }
        Err(QuillError::ModelLoadingError {
            model,
            message,
            available_models,
        }) => {
            eprintln!("{} {}", format!("Model '{}' could not be loaded:", model).red(), message);
            if !available_models.is_empty() {
                eprintln!("Available models: {}", available_models.join(", "));
            }
            std::process::exit(1);
        }
        Err(error) => Err(error.into()),
    }
}

async fn transcribe(config: &QuillConfig, file: PathBuf) -> anyhow::Result<()> {
    let client = TranscriptionClient::from_config(config, reqwest::Client::new());
    let transcript = client.transcribe_file(&file).await;
    if transcript.is_placeholder() {
        eprintln!("{}", "Transcription failed".red());
    }
    println!("{}", transcript.text);
    Ok(())
}

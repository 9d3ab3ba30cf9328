//! PocketLLM - Local LLM command line
//!
//! Loads a GGUF model and streams a completion to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocketllm::inference::{BackendKind, SessionController, StepFailurePolicy, StreamToken};
use pocketllm::storage::models::{discover_models, resolve_model};
use pocketllm::storage::settings::{
    get_settings_path, load_settings, load_settings_from, save_settings, save_settings_to,
    SessionSettings,
};
use pocketllm::storage::{init_storage, StorageError};
use pocketllm::SessionError;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No model given and no default_model in settings")]
    NoModel,
    #[error("Generation failed: {0}")]
    Generation(String),
}

#[derive(Debug, Parser)]
#[command(name = "pocketllm", version, about = "Run a local GGUF model")]
struct Cli {
    /// Settings file (defaults to the platform data directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream a completion for a prompt. Ctrl-C stops generation.
    Generate {
        prompt: String,
        /// Model file name in the models directory, or a path
        #[arg(short, long)]
        model: Option<String>,
        #[arg(short = 'n', long)]
        max_tokens: Option<usize>,
        #[arg(short, long)]
        threads: Option<u32>,
        #[arg(short, long)]
        context_size: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        seed: Option<u32>,
        /// Report a failed decode step as an error
        #[arg(long)]
        strict: bool,
    },
    /// List GGUF models in the models directory
    Models,
    /// Print the effective settings
    Settings {
        /// Write them back to the settings file
        #[arg(long)]
        save: bool,
    },
}

fn parse_backend(value: &str) -> Result<BackendKind, String> {
    match value {
        "llama-cpp" => Ok(BackendKind::LlamaCpp),
        "simulated" => Ok(BackendKind::Simulated),
        "unavailable" => Ok(BackendKind::Unavailable),
        other => Err(format!(
            "unknown backend '{other}' (expected llama-cpp, simulated or unavailable)"
        )),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only generated text
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pocketllm=info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Err(e) = init_storage() {
        warn!("Could not prepare the data directory: {}", e);
    }

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }

    match cli.command {
        Command::Generate {
            prompt,
            model,
            max_tokens,
            threads,
            context_size,
            temperature,
            seed,
            strict,
        } => {
            if let Some(t) = threads {
                settings.threads = t;
            }
            if let Some(c) = context_size {
                settings.context_size = c;
            }
            if let Some(t) = temperature {
                settings.temperature = t;
            }
            if let Some(s) = seed {
                settings.seed = s;
            }
            if strict {
                settings.step_failure_policy = StepFailurePolicy::ReportError;
            }
            settings.validate();

            let model = model.or_else(|| settings.default_model.clone());
            let max_tokens = max_tokens.unwrap_or(settings.max_tokens);
            generate(&settings, model, &prompt, max_tokens).await
        }
        Command::Models => list_models(&settings),
        Command::Settings { save } => show_settings(&settings, cli.settings, save),
    }
}

async fn generate(
    settings: &SessionSettings,
    model: Option<String>,
    prompt: &str,
    max_tokens: usize,
) -> Result<(), CliError> {
    let controller = SessionController::from_settings(settings)?;

    let model_path = match model {
        Some(name) => match resolve_model(&name, &settings.models_directory) {
            Ok(path) => path,
            // Only llama.cpp needs a real file
            Err(e) if controller.backend() != "llama-cpp" => {
                warn!("{}; passing '{}' through to {}", e, name, controller.backend());
                PathBuf::from(name)
            }
            Err(e) => return Err(e.into()),
        },
        None if settings.backend == BackendKind::Simulated => PathBuf::from("simulated"),
        None => return Err(CliError::NoModel),
    };

    let info = match controller.load(&model_path, settings.threads, settings.context_size) {
        Ok(info) => info,
        Err(e) => {
            if e.is_load_failure() {
                warn!(
                    "Run `pocketllm models` to list models in {}",
                    settings.models_directory.display()
                );
            }
            return Err(e.into());
        }
    };
    info!(
        "Loaded {} ({} backend, {} ctx, {} threads)",
        info.path.display(),
        info.backend,
        info.context_size,
        info.threads
    );

    let mut rx = controller.generate_async(prompt, max_tokens)?;
    let mut stdout = tokio::io::stdout();
    let mut failure = None;
    let mut aborted = false;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(StreamToken::Token(fragment)) => {
                    stdout.write_all(fragment.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(StreamToken::Error(message)) => failure = Some(message),
                Some(StreamToken::Done) | None => break,
            },
            _ = tokio::signal::ctrl_c(), if !aborted => {
                controller.request_abort();
                aborted = true;
            }
        }
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    info!("{} tokens in context", controller.context_used());
    controller.unload();

    match failure {
        Some(message) => Err(CliError::Generation(message)),
        None => Ok(()),
    }
}

fn list_models(settings: &SessionSettings) -> Result<(), CliError> {
    let models = discover_models(&settings.models_directory)?;
    if models.is_empty() {
        println!("No models in {}", settings.models_directory.display());
        return Ok(());
    }

    for model in models {
        let version = model
            .gguf_version
            .map(|v| format!("GGUF v{v}"))
            .unwrap_or_else(|| "not GGUF".to_string());
        println!("{:<48} {:>10}  {}", model.filename, model.size_string(), version);
    }
    Ok(())
}

fn show_settings(
    settings: &SessionSettings,
    path: Option<PathBuf>,
    save: bool,
) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(settings).map_err(StorageError::from)?);

    if save {
        let written = match path {
            Some(path) => {
                save_settings_to(settings, &path)?;
                path
            }
            None => save_settings(settings)?,
        };
        info!("Saved settings to {}", written.display());
    } else if let Ok(path) = get_settings_path() {
        info!("Settings file: {}", path.display());
    }
    Ok(())
}

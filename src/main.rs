//! `rlm` command line: run tasks against the engine and watch the stream.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rlm_engine::{
    Engine, EngineConfig, EngineEvent, MockBrowserDriver, ModelClient, ScriptedClient,
};

#[derive(Debug, Parser)]
#[command(name = "rlm", version, about = "Recursive language model engine over browser tabs")]
struct Cli {
    /// Path to the engine configuration file.
    #[arg(long, global = true, default_value = "rlm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a task and print the event stream.
    Run {
        /// The task message.
        task: String,

        /// Use the in-memory driver and a canned model script (no network).
        #[arg(long)]
        mock: bool,

        /// Override the configured iteration cap.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show the effective configuration (API key redacted).
    Config,
    /// Encrypt and store an API key in the configuration file.
    SetKey {
        /// The API key value; prompted for when omitted.
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            task,
            mock,
            max_iterations,
        } => run_task(&cli.config, &task, mock, max_iterations).await,
        Commands::Config => show_config(&cli.config),
        Commands::SetKey { key } => set_key(&cli.config, key),
    }
}

fn load_config(path: &PathBuf) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path).map_err(|err| anyhow!(err))
    } else {
        Ok(EngineConfig::default())
    }
}

async fn run_task(
    config_path: &PathBuf,
    task: &str,
    mock: bool,
    max_iterations: Option<u32>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(cap) = max_iterations {
        config.max_iterations = cap;
    }

    let driver = MockBrowserDriver::with_blank_tab();
    let engine = if mock {
        let script: Arc<dyn ModelClient> = Arc::new(ScriptedClient::from_texts([
            "```repl\nconst pages = tabs;\nenv.count = pages.length;\nlog(`tabs: ${env.count}`);\n```",
            "```repl\nsetFinal(`demo finished with ${env.count} tab(s)`)\n```",
        ]));
        Engine::with_model_clients(config, driver, Arc::clone(&script), script)
    } else {
        Engine::new(config, driver)
    };

    let mut events = engine.subscribe();
    engine
        .submit_task(task)
        .map_err(|err| anyhow!("submit failed: {err}"))?;

    let stdout = std::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(_) => break,
        };
        let done = event.is_complete();
        print_event(&stdout, &event)?;
        if done {
            break;
        }
    }
    Ok(())
}

fn print_event(stdout: &std::io::Stdout, event: &EngineEvent) -> Result<()> {
    let mut out = stdout.lock();
    match event {
        EngineEvent::StreamToken { token, .. } => {
            write!(out, "{token}")?;
            out.flush()?;
        }
        EngineEvent::IterationStart { iteration, .. } => {
            writeln!(out, "\n=== iteration {iteration} ===")?;
        }
        EngineEvent::CodeGenerated { code, block_index } => {
            writeln!(out, "\n--- block {block_index} ---\n{code}")?;
        }
        EngineEvent::CodeResult {
            metadata,
            block_index,
            ..
        } => {
            writeln!(out, "--- result {block_index}: {metadata}")?;
        }
        EngineEvent::Log { message } => writeln!(out, "[log] {message}")?,
        EngineEvent::Error { error } => writeln!(out, "[error] {error}")?,
        EngineEvent::Complete { final_value } => {
            writeln!(
                out,
                "\n=== complete: {} ===",
                final_value
                    .as_ref()
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "null".to_string())
            )?;
        }
        other => {
            writeln!(out, "[event] {}", serde_json::to_string(other)?)?;
        }
    }
    Ok(())
}

fn show_config(path: &PathBuf) -> Result<()> {
    let mut config = load_config(path)?;
    if config.api_key.is_some() {
        config.api_key = Some("<configured>".to_string());
    }
    println!("{}", toml::to_string_pretty(&config).context("render config")?);
    Ok(())
}

fn set_key(path: &PathBuf, key: Option<String>) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => {
            eprint!("API key: ");
            let mut buffer = String::new();
            std::io::stdin().read_line(&mut buffer)?;
            buffer.trim().to_string()
        }
    };
    if key.is_empty() {
        return Err(anyhow!("empty API key"));
    }
    let mut config = load_config(path)?;
    config.api_key = Some(key);
    config.save(path).map_err(|err| anyhow!(err))?;
    println!("API key stored (encrypted) in {}", path.display());
    Ok(())
}

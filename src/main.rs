//! autodev CLI
//!
//! Runs an autonomous development session against a project directory and
//! streams engine events to stdout as JSON lines.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use autodev::{
    CycleEngine, EngineConfig, EventBus, ExecutorConfig, MemoryStore, StartRequest, Store,
    SubprocessExecutor,
};

#[derive(Parser)]
#[command(name = "autodev", version, about = "Autonomous coding-assistant orchestration")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a session until it completes or is interrupted
    Run {
        /// Project directory (defaults to the current directory)
        #[arg(short, long)]
        project: Option<PathBuf>,

        /// High-level goal for the session
        #[arg(short, long)]
        goal: Option<String>,

        /// Stop after this many cycles (0 = unlimited)
        #[arg(long)]
        max_cycles: Option<u32>,

        /// Spending ceiling in USD (0 = unlimited)
        #[arg(long)]
        budget: Option<f64>,

        /// Run fix and improve work through the persona pipeline
        #[arg(long)]
        pipeline: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let level = if std::env::var("AUTODEV_DEBUG").is_ok_and(|v| v == "1") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> autodev::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            project,
            goal,
            max_cycles,
            budget,
            pipeline,
        } => {
            if let Some(max_cycles) = max_cycles {
                config.max_cycles = max_cycles;
            }
            if let Some(budget) = budget {
                config.budget_usd = budget;
            }
            config.pipeline_mode |= pipeline;
            let project = match project.or_else(|| config.project_path.clone()) {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            run_session(config, project, goal).await
        }
    }
}

async fn run_session(
    config: EngineConfig,
    project: PathBuf,
    goal: Option<String>,
) -> autodev::Result<ExitCode> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let executor = SubprocessExecutor::new(
        ExecutorConfig::claude(config.assistant_binary.clone(), config.model.as_deref())
            .with_kill_grace(config.kill_grace()),
    );
    let events = Arc::new(EventBus::new(config.event_buffer_size));
    let engine = CycleEngine::new(store, Arc::new(executor), events.clone(), config);

    let (listener, mut event_rx) = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "could not serialize event"),
            }
        }
    });

    let session = match engine.start(StartRequest {
        project_path: Some(project),
        goal,
    }) {
        Ok(session) => session,
        Err(e) => {
            events.remove_listener(listener);
            return Err(e);
        }
    };
    tracing::info!(session_id = %session.id, "running; press Ctrl-C to stop");

    let mut status_rx = engine.watch_status();
    let finished = status_rx.wait_for(|s| {
        s.session_id.as_deref() == Some(session.id.as_str())
            && s.status.is_some_and(|status| status.is_terminal() || status == autodev::SessionStatus::Paused)
    });

    tokio::select! {
        result = finished => {
            if result.is_err() {
                tracing::warn!("status channel closed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping session");
            engine.stop()?;
        }
    }

    // Dropping the listener closes the channel once queued events are printed.
    events.remove_listener(listener);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer failed");
    }

    let status = engine.status();
    eprintln!(
        "Session {} ended: {} cycles, ${:.2}, status {}",
        session.id,
        status.total_cycles,
        status.total_cost_usd,
        status
            .status
            .map_or_else(|| "unknown".to_string(), |s| s.to_string())
    );
    Ok(exit_code(status.status))
}

/// A session that paused itself, on repeated failures, did not finish.
fn exit_code(status: Option<autodev::SessionStatus>) -> ExitCode {
    match status {
        Some(autodev::SessionStatus::Paused) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodev::SessionStatus;

    #[test]
    fn paused_session_exits_with_failure() {
        assert_eq!(exit_code(Some(SessionStatus::Paused)), ExitCode::FAILURE);
        assert_eq!(exit_code(Some(SessionStatus::Completed)), ExitCode::SUCCESS);
        assert_eq!(exit_code(Some(SessionStatus::Stopped)), ExitCode::SUCCESS);
    }
}

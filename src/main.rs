mod artifacts;
mod config;
mod db;
mod poller;
mod providers;
mod redact;
mod render;
mod runner;
mod runs;
mod schema;
mod server;
mod stages;
#[cfg(test)]
mod test_support;
mod transport;

use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use poller::{HttpRunSource, PollOutcome, PollerConfig, RunPoller, RunSource, SqliteRunSource};
use server::AppState;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "roof-dynamics", version, about = "Roof inspection run orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Follow a run until it finishes or the poll budget runs out.
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Dashboard API base URL.
    #[arg(long, conflicts_with = "db")]
    server: Option<String>,
    /// Read runs directly from a local database file.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Existing run to observe instead of submitting a new one.
    #[arg(long)]
    run_id: Option<String>,
    /// Address to submit through the server.
    #[arg(required_unless_present = "run_id", conflicts_with = "run_id")]
    address: Option<String>,
    #[arg(long, default_value_t = 2)]
    interval_secs: u64,
    #[arg(long, default_value_t = 300)]
    budget_secs: u64,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_json);

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(&config),
        Command::Watch(args) => run_watch(&config, args),
    };
    match result {
        Ok(code) => code,
        Err(message) => {
            tracing::error!(error = %redact::sanitize_log_message(&message), "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run_server(config: &AppConfig) -> Result<ExitCode, String> {
    let state = AppState::from_config(config).map_err(|e| e.to_string())?;
    server::serve(Arc::new(state), &config.bind_addr).map_err(|e| e.to_string())?;
    Ok(ExitCode::SUCCESS)
}

fn run_watch(config: &AppConfig, args: WatchArgs) -> Result<ExitCode, String> {
    let poll_config = PollerConfig {
        interval: Duration::from_secs(args.interval_secs.max(1)),
        budget: Duration::from_secs(args.budget_secs),
    };

    if let Some(db) = args.db.clone() {
        let run_id = args
            .run_id
            .clone()
            .ok_or("--db can only observe an existing run; pass --run-id")?;
        return watch(RunPoller::new(SqliteRunSource::new(db), poll_config), &run_id);
    }

    let server_url = args
        .server
        .clone()
        .unwrap_or_else(|| format!("http://{}", config.bind_addr));
    let source = HttpRunSource::new(&server_url).map_err(|e| e.to_string())?;
    let run_id = match (args.run_id, args.address) {
        (Some(run_id), _) => run_id,
        (None, Some(address)) => {
            let run = source.submit(&address).map_err(|e| e.to_string())?;
            println!("submitted {} for {}", run.id, run.address);
            run.id
        }
        (None, None) => return Err("an address or --run-id is required".to_string()),
    };
    watch(RunPoller::new(source, poll_config), &run_id)
}

fn watch<S: RunSource>(poller: RunPoller<S>, run_id: &str) -> Result<ExitCode, String> {
    let outcome = poller
        .watch(run_id, |run, phase| {
            println!("[{:>3}%] {} ({})", phase.progress(), phase.as_str(), run.current_step);
        })
        .map_err(|e| e.to_string())?;

    match outcome {
        PollOutcome::Finished(run) => {
            println!("run {} finished: {}", run.id, run.status);
            if let Some(url) = run.pdf_url.as_deref() {
                println!("report: {url}");
            }
            if let Some(message) = run.error_message.as_deref() {
                println!("error: {message}");
            }
            Ok(match run.status {
                runs::RunStatus::Completed => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }
        PollOutcome::TimedOut { last_seen } => {
            let step = last_seen
                .map(|run| run.current_step.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("timed out waiting for {run_id}; last step {step}. The run may still finish.");
            Ok(ExitCode::from(2))
        }
    }
}

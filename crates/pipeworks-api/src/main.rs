//! Pipeworks CLI entry point.
//!
//! Binary name: `pipeworks`
//!
//! Parses CLI arguments, initializes tracing and the data directory, then
//! dispatches to the appropriate command handler.

mod cli;
mod state;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap_complete::generate;
use pipeworks_infra::filesystem::{resolve_data_dir, DataLayout};
use pipeworks_observe::tracing_setup::{default_filter, init_tracing, shutdown_tracing, TracingOptions};
use uuid::Uuid;

use cli::run::RunArgs;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pipeworks", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = resolve_data_dir();

    // A run gets its id up front so its log file can be opened with the subscriber
    let execution_id = cli.command.starts_execution().then(Uuid::now_v7);

    init_tracing(TracingOptions {
        default_filter: default_filter(cli.verbose, cli.quiet).to_string(),
        execution_log: execution_id.map(|id| DataLayout::new(&data_dir).execution_log_path(id)),
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli, data_dir, execution_id).await;

    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, data_dir: PathBuf, execution_id: Option<Uuid>) -> anyhow::Result<()> {
    let state = AppState::init(data_dir)
        .await
        .context("failed to prepare the data directory")?;

    match cli.command {
        Commands::Execs { all } => {
            cli::executions::list_executions(&state, all, cli.json).await?;
        }

        Commands::Exec { id } => {
            cli::executions::show_execution(&state, id, cli.json).await?;
        }

        Commands::Active => {
            cli::executions::list_active(&state, cli.json).await?;
        }

        Commands::Today => {
            cli::executions::list_today(&state, cli.json).await?;
        }

        Commands::Clear { hours, force } => {
            cli::executions::clear_executions(&state, hours, force, cli.json).await?;
        }

        Commands::Run {
            mode,
            resume_from,
            skip,
            name,
        } => {
            let execution_id = execution_id.unwrap_or_else(Uuid::now_v7);
            let args = RunArgs {
                mode,
                resume_from,
                skip,
                name,
            };
            cli::run::run_demo(&state, args, execution_id, shutdown_signal(), cli.json, cli.quiet)
                .await?;
        }

        // Handled in main before tracing starts
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

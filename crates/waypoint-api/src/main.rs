//! Waypoint CLI entry point.
//!
//! Binary name: `wpt`
//!
//! Parses CLI arguments, initializes tracing, the journal database and the
//! workflow manager, then dispatches to the command handler.

mod cli;
mod demo;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;
use waypoint_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "wpt", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.json).await?;
    tracing::debug!(data_dir = %state.data_dir.display(), "application state ready");

    match cli.command {
        Commands::Demo {
            run_secs,
            cancel_after_ms,
            fail_run,
        } => {
            cli::demo::handle_demo(&state, run_secs, cancel_after_ms, fail_run, cli.json).await?;
        }
        Commands::Status { id } => cli::workflow::handle_status(&state, &id, cli.json).await?,
        Commands::List { limit } => cli::workflow::handle_list(&state, limit, cli.json).await?,
        Commands::Cancel { id } => cli::workflow::handle_cancel(&state, &id, cli.json).await?,
        Commands::Cleanup { id } => cli::workflow::handle_cleanup(&state, &id, cli.json).await?,
        Commands::Recover => cli::workflow::handle_recover(&state, cli.json).await?,
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    state.db_pool.close().await;
    Ok(())
}

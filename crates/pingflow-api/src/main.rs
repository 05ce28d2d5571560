//! pingflow CLI and REST API entry point.
//!
//! Binary name: `pingflow`
//!
//! Parses CLI arguments, sets up tracing, opens the engine over the SQLite
//! data directory, then dispatches to the command handler or starts the
//! server with its background loops.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use pingflow_observe::tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pingflow", &mut std::io::stdout());
        return Ok(());
    }

    let options = TracingOptions {
        format: if cli.log_format == "json" { LogFormat::Json } else { LogFormat::Pretty },
        enable_otel: cli.otel,
        verbosity: cli.verbosity(),
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Serve { port, host, no_workers } => {
            cli::serve::serve(state, host, port, !no_workers).await?;
        }
        Commands::Submit { name, data, key } => {
            cli::events::submit(&state, &name, &data, key, cli.json).await?;
        }
        Commands::Run { id } => {
            cli::runs::show_run(&state, &id, cli.json).await?;
        }
        Commands::Runs { state: run_state, definition, limit } => {
            cli::runs::list_runs(&state, run_state.as_deref(), definition, limit, cli.json).await?;
        }
        Commands::Workflows => {
            cli::runs::list_workflows(&state, cli.json)?;
        }
        Commands::Tick => {
            cli::serve::tick(&state, cli.json).await?;
        }
        Commands::Completions { .. } => unreachable!("handled in main"),
    }

    Ok(())
}

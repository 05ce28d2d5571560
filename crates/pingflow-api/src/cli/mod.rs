//! CLI command definitions for the `pingflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod events;
pub mod runs;
pub mod serve;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable workflow engine for the PingUp social app.
#[derive(Parser)]
#[command(name = "pingflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log format for the tracing subscriber.
    #[arg(long, global = true, value_parser = ["pretty", "json"], default_value = "pretty")]
    pub log_format: String,

    /// Export spans to stdout via OpenTelemetry.
    #[arg(long, global = true, env = "PINGFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Verbosity for the tracing filter: -1 quiet, then one step per `-v`.
    pub fn verbosity(&self) -> i8 {
        if self.quiet {
            -1
        } else {
            self.verbose.min(2) as i8
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API together with the worker, sleep-scanner and cron loops.
    Serve {
        /// Port to listen on (defaults to `http.port` in config.toml).
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind (defaults to `http.host` in config.toml).
        #[arg(long)]
        host: Option<String>,

        /// Serve the API only; leave run processing to another process.
        #[arg(long)]
        no_workers: bool,
    },

    /// Submit an event.
    Submit {
        /// Event name, e.g. `connection.requested`.
        name: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,

        /// Deduplication key; resubmitting with the same key creates no new runs.
        #[arg(long)]
        key: Option<String>,
    },

    /// Show one run with its step memo table.
    Run {
        /// Run UUID.
        id: String,
    },

    /// List runs, newest first.
    #[command(alias = "ls")]
    Runs {
        /// Filter by state (pending, running, sleeping, completed, failed).
        #[arg(long)]
        state: Option<String>,

        /// Filter by workflow definition id.
        #[arg(long)]
        definition: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List registered workflow definitions.
    Workflows,

    /// One processing pass: wake due sleepers, fire due cron slots, then
    /// run every claimable run to its next suspension point.
    Tick,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

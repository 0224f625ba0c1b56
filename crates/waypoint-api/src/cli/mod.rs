//! CLI command definitions for the `wpt` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod demo;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect durable workflows.
#[derive(Parser)]
#[command(name = "wpt", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for engine debug logs, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the prep / run / wrap-up demo workflow to completion.
    Demo {
        /// How long the durable `run` step works, in seconds.
        #[arg(long, default_value = "3")]
        run_secs: u64,

        /// Request cancellation this many milliseconds after start.
        #[arg(long)]
        cancel_after_ms: Option<u64>,

        /// Make the `run` step fail.
        #[arg(long)]
        fail_run: bool,
    },

    /// Show the persisted record of a workflow.
    Status {
        /// Workflow UUID.
        id: String,
    },

    /// List persisted workflow records, newest first.
    #[command(alias = "ls")]
    List {
        /// Maximum number of records to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Request cancellation of a workflow. Takes effect at its next step boundary.
    Cancel {
        /// Workflow UUID.
        id: String,
    },

    /// Delete a workflow's persisted state.
    #[command(alias = "rm")]
    Cleanup {
        /// Workflow UUID.
        id: String,
    },

    /// Resume unfinished workflows and deliver pending completions.
    Recover,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

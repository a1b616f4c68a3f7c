//! Command line interface built on clap.
//!
//! Global flags override the matching `workpoll.toml` settings.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// workpoll, a poll-driven workflow engine.
#[derive(Debug, Parser)]
#[command(name = "workpoll", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Host name to poll as.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// State file to read and write.
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Abort on the first executor or expression error.
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,

    /// Enable verbose (debug level) logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Imports a workflow definition from a TOML or JSON file.
    Load {
        file: PathBuf,
    },

    /// Marks a workflow as published so it can be started.
    Publish {
        /// Workflow name or id.
        workflow: String,
    },

    /// Marks a workflow as deprecated.
    Deprecate {
        workflow: String,
    },

    /// Moves a workflow back to draft.
    Draft {
        workflow: String,
    },

    /// Starts an instance of a published workflow.
    Start {
        workflow: String,

        /// JSON object used as the start metadata.
        #[arg(long)]
        payload: Option<String>,

        /// Restrict the instance's workitems to this host.
        #[arg(long)]
        runner_host: Option<String>,
    },

    /// Runs manage cycles until interrupted.
    Manage {
        /// Run a single cycle and exit.
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Seconds between cycles, overriding the configuration.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Shows workflows, instances and workitems.
    Status,

    /// Runs a built-in two-action workflow in memory.
    Demo,
}

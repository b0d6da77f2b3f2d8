//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Create a starter workflow
    Init {
        /// Overwrite an existing starter workflow
        #[arg(long)]
        force: bool,
    },

    /// Validate workflow files
    Validate {
        /// Workflow files; defaults to every workflow in the workflows directory
        paths: Vec<PathBuf>,
    },

    /// Show the runs an event would start, without running them
    Plan {
        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Simulate an event and execute every run it triggers
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,

        /// Keep run workspaces after they finish
        #[arg(long)]
        keep_workspace: bool,

        /// Run steps directly in this directory instead of a fresh workspace
        #[arg(long, value_name = "DIR")]
        in_place: Option<PathBuf>,
    },

    /// Print the JSON schema of the workflow format
    Schema {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Describes the event being simulated.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Event kind
    #[arg(long, value_enum, default_value_t = EventKind::Push)]
    pub event: EventKind,

    /// Pushed branch, or the pull request's head branch
    #[arg(short, long, default_value = "main")]
    pub branch: String,

    /// Target branch of a pull request
    #[arg(long, default_value = "main")]
    pub base: String,

    /// Pull request number
    #[arg(long)]
    pub number: Option<u64>,

    /// Changed files (comma separated or repeated)
    #[arg(long, value_delimiter = ',')]
    pub changed: Vec<String>,

    /// Commit SHA
    #[arg(long)]
    pub sha: Option<String>,

    /// Directory holding workflow files
    #[arg(long, value_name = "DIR")]
    pub workflows: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Push,
    PullRequest,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

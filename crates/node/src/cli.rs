use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use jobrelay_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "jobrelay", version, about = "Reliable job delivery: workers and status reconciler")]
pub struct Cli {
    /// Log output format.
    #[arg(long, global = true, env = "JOBRELAY_LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker pool and the reconciler pool in one process.
    All(RunArgs),
    /// Run only the worker pool.
    Worker(RunArgs),
    /// Run only the reconciler pool.
    Reconciler(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    pub run_for_secs: Option<u64>,

    /// Submit this many sample jobs at startup.
    #[arg(long, default_value_t = 0)]
    pub submit: usize,
}

impl RunArgs {
    pub fn run_for(&self) -> Option<Duration> {
        self.run_for_secs.map(Duration::from_secs)
    }
}

impl Command {
    pub fn args(&self) -> &RunArgs {
        match self {
            Command::All(args) | Command::Worker(args) | Command::Reconciler(args) => args,
        }
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Command::All(_) | Command::Worker(_))
    }

    pub fn runs_reconciler(&self) -> bool {
        matches!(self, Command::All(_) | Command::Reconciler(_))
    }
}

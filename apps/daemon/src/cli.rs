//! Command-line surface of the backup service.

use clap::{Parser, Subcommand};

/// Pixiv personal-archive backup service
#[derive(Parser, Debug)]
#[command(name = "pixiv-backup")]
#[command(about = "Mirror bookmarked and followed-author works to local storage", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Run the daemon loop in the foreground (alternate invocation used
    /// by the init script)
    #[arg(long)]
    pub daemon: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the daemon in the background
    Start {
        /// Drop the force-run sentinel before launching so the first
        /// round starts immediately
        #[arg(long)]
        force_run: bool,
    },

    /// Ask a running daemon to stop, then wait for it to exit
    Stop,

    /// Stop then start
    Restart,

    /// Print the runtime status snapshot
    Status,

    /// Validate configuration and upstream connectivity
    Test,

    /// Drop the force-run sentinel without starting anything
    Trigger,

    /// Run a single synchronous round with an explicit download budget
    Run {
        /// Download budget for this round; 0 means unlimited
        count: u32,
    },

    /// Tail the service log
    Log {
        /// Number of trailing lines to print first
        #[arg(short = 'n', long = "lines", default_value = "50")]
        lines: usize,

        /// Print the tail and exit instead of following
        #[arg(long)]
        no_follow: bool,

        /// Read the per-day log file (default)
        #[arg(long, conflicts_with = "syslog")]
        file: bool,

        /// Read from the system log via logread instead
        #[arg(long, conflicts_with = "file")]
        syslog: bool,
    },

    /// Diagnose (and optionally fix) on-disk state
    Repair {
        /// Report problems without touching anything (default)
        #[arg(long, conflicts_with = "apply")]
        check: bool,

        /// Fix what can be fixed: release stuck queue items, sweep temp
        /// files, quarantine corrupt documents, drop the token cache
        #[arg(long, conflicts_with = "check")]
        apply: bool,
    },
}

//! mirrorsync: configure and drive mirror synchronization between
//! source-control instances.
//!
//! # Usage
//!
//! ```text
//! mirrorsync init
//! mirrorsync target add <id> --url <base-url> --token-env <VAR> [--label <text>]
//! mirrorsync target list
//! mirrorsync pair add <id> --source <target> --target <target> [--direction push|pull] [--reverse <id>]
//! mirrorsync pair list | remove <id>
//! mirrorsync mirror add <pair> <project-id> <project-path> [--issues] [--no-trigger] [--disabled]
//! mirrorsync mirror remove <pair> <project-id>
//! mirrorsync mirror list <pair>
//! mirrorsync sync <pair> [--project <id>] [--local] [--json] [--verbose]
//! mirrorsync status [--pair <id>] [--json]
//! mirrorsync conflicts [--json]
//! mirrorsync daemon start|stop|status|tick|logs
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    conflicts::ConflictsArgs, daemon::DaemonCommand, init::InitArgs, mirror::MirrorCommand,
    pair::PairCommand, status::StatusArgs, sync::SyncArgs, target::TargetCommand,
};
use mirrorsync_core::Direction;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "mirrorsync",
    version,
    about = "Keep repository mirrors and issues in sync across source-control instances",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create ~/.mirrorsync with a default config.yaml.
    Init(InitArgs),

    /// Manage remote instances.
    Target {
        #[command(subcommand)]
        command: TargetCommand,
    },

    /// Manage sync pairs between two targets.
    Pair {
        #[command(subcommand)]
        command: PairCommand,
    },

    /// Manage mirrored projects within a pair.
    Mirror {
        #[command(subcommand)]
        command: MirrorCommand,
    },

    /// Sync one mirror, or every mirror of a pair, through the daemon when it
    /// runs and in this process otherwise.
    Sync(SyncArgs),

    /// Show checkpoint and due state for every mirror.
    Status(StatusArgs),

    /// Show conflicts recorded by the running daemon.
    Conflicts(ConflictsArgs),

    /// Run and control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared Direction argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `Direction` from CLI args.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionArg(pub Direction);

impl FromStr for DirectionArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(Self(Direction::Push)),
            "pull" => Ok(Self(Direction::Pull)),
            other => Err(format!("unknown direction '{other}'; expected: push, pull")),
        }
    }
}

impl fmt::Display for DirectionArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        d.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Target { command } => commands::target::run(command),
        Commands::Pair { command } => commands::pair::run(command),
        Commands::Mirror { command } => commands::mirror::run(command),
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Conflicts(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

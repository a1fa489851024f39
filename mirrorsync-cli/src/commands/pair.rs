//! `mirrorsync pair add|list|remove`

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_core::{registry, PairId, TargetId};
use mirrorsync_engine::StateStore;

use crate::DirectionArg;

#[derive(Subcommand, Debug)]
pub enum PairCommand {
    /// Register a pair between two existing targets.
    Add(AddArgs),
    /// List pairs with their mirror counts.
    List,
    /// Delete a pair's configuration and checkpoints.
    Remove {
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub id: String,

    /// Target the pair reads from.
    #[arg(long)]
    pub source: String,

    /// Target the pair writes to.
    #[arg(long)]
    pub target: String,

    /// push: the source pushes to the target; pull: the target pulls from the source.
    #[arg(long, default_value = "push")]
    pub direction: DirectionArg,

    /// Seconds between scheduled syncs of each mirror.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Also create the reverse pair under this id.
    #[arg(long, value_name = "ID")]
    pub reverse: Option<String>,
}

#[derive(Tabled)]
struct PairRow {
    id: String,
    source: String,
    target: String,
    direction: String,
    mirrors: usize,
    interval: String,
}

pub fn run(cmd: PairCommand) -> Result<()> {
    let home = super::home()?;
    match cmd {
        PairCommand::Add(args) => add(&home, args),
        PairCommand::List => list(&home),
        PairCommand::Remove { id } => {
            let pair_id = PairId::from(id.clone());
            let removed = registry::remove_pair_at(&home, &pair_id)
                .with_context(|| format!("failed to remove pair '{id}'"))?;
            super::local_store(&home)?
                .remove_checkpoints(&pair_id)
                .with_context(|| format!("failed to remove checkpoints of '{id}'"))?;
            if removed {
                println!("✓ Removed pair '{id}'");
            } else {
                println!("No pair named '{id}'.");
            }
            Ok(())
        }
    }
}

fn add(home: &std::path::Path, args: AddArgs) -> Result<()> {
    if args.interval == Some(0) {
        bail!("--interval must be at least 1 second");
    }
    let id = PairId::from(args.id.clone());
    let mut pair = registry::add_pair_at(
        home,
        id.clone(),
        TargetId::from(args.source),
        TargetId::from(args.target),
        args.direction.into(),
    )
    .with_context(|| format!("failed to add pair '{}'", args.id))?;

    if let Some(secs) = args.interval {
        pair.sync_interval_secs = secs;
        registry::save_pair_at(home, &pair)
            .with_context(|| format!("failed to save pair '{}'", args.id))?;
    }
    println!(
        "✓ Pair '{}': {} → {} ({})",
        pair.id, pair.source, pair.target, pair.direction
    );

    if let Some(reverse_id) = args.reverse {
        let reverse = registry::add_reverse_pair_at(home, &id, PairId::from(reverse_id.clone()))
            .with_context(|| format!("failed to add reverse pair '{reverse_id}'"))?;
        println!(
            "✓ Pair '{}': {} → {} ({})",
            reverse.id, reverse.source, reverse.target, reverse.direction
        );
    }
    Ok(())
}

fn list(home: &std::path::Path) -> Result<()> {
    let pairs = registry::list_pairs_at(home).context("failed to load pairs")?;
    if pairs.is_empty() {
        println!("No pairs registered.");
        return Ok(());
    }

    let rows: Vec<PairRow> = pairs
        .into_iter()
        .map(|p| PairRow {
            id: p.id.0,
            source: p.source.0,
            target: p.target.0,
            direction: p.direction.to_string(),
            mirrors: p.mirrors.len(),
            interval: format!("{}s", p.sync_interval_secs),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

//! `mirrorsync mirror add|remove|list`

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_core::settings::resolve_for;
use mirrorsync_core::{registry, MirrorConfig, MirrorOptions, PairId, ProjectId};
use mirrorsync_engine::StateStore;

#[derive(Subcommand, Debug)]
pub enum MirrorCommand {
    /// Add or replace a mirrored project in a pair.
    Add(AddArgs),
    /// Stop mirroring a project and drop its checkpoint.
    Remove { pair: String, project_id: u64 },
    /// List a pair's mirrors with their resolved settings.
    List { pair: String },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub pair: String,

    /// Project id on the source instance.
    pub project_id: u64,

    /// Full project path, e.g. "team/backend/api".
    pub project_path: String,

    /// Also sync issues for this project.
    #[arg(long)]
    pub issues: bool,

    /// Do not trigger an immediate mirror update after configuring it.
    #[arg(long)]
    pub no_trigger: bool,

    /// Keep the mirror configured but skip it when scheduling.
    #[arg(long)]
    pub disabled: bool,

    /// Only mirror branches matching this regex.
    #[arg(long, value_name = "REGEX")]
    pub branch_regex: Option<String>,
}

impl AddArgs {
    /// Flags only become overrides when given; unset flags defer to the
    /// group and pair tiers.
    fn overrides(&self) -> MirrorOptions {
        MirrorOptions {
            enabled: self.disabled.then_some(false),
            mirror_issues: self.issues.then_some(true),
            trigger_update: self.no_trigger.then_some(false),
            branch_regex: self.branch_regex.clone(),
            ..MirrorOptions::default()
        }
    }
}

#[derive(Tabled)]
struct MirrorRow {
    project: u64,
    path: String,
    enabled: bool,
    issues: bool,
    trigger: bool,
    branches: String,
}

pub fn run(cmd: MirrorCommand) -> Result<()> {
    let home = super::home()?;
    match cmd {
        MirrorCommand::Add(args) => add(&home, args),
        MirrorCommand::Remove { pair, project_id } => remove(&home, &pair, ProjectId(project_id)),
        MirrorCommand::List { pair } => list(&home, &pair),
    }
}

fn add(home: &Path, args: AddArgs) -> Result<()> {
    let mirror = MirrorConfig {
        project_id: ProjectId(args.project_id),
        project_path: args.project_path.trim_matches('/').to_string(),
        overrides: args.overrides(),
    };
    let pair = registry::upsert_mirror_at(home, &PairId::from(args.pair.clone()), mirror)
        .with_context(|| format!("failed to update pair '{}'", args.pair))?;
    println!(
        "✓ Mirroring {} ({}) via '{}' [{} mirrors]",
        args.project_path,
        args.project_id,
        pair.id,
        pair.mirrors.len()
    );
    Ok(())
}

fn remove(home: &Path, pair_id: &str, project_id: ProjectId) -> Result<()> {
    let pair = registry::load_pair_at(home, &PairId::from(pair_id))
        .with_context(|| format!("failed to load pair '{pair_id}'"))?;
    let removed = registry::remove_mirror_at(home, &pair.id, project_id)
        .with_context(|| format!("failed to update pair '{pair_id}'"))?;
    if !removed {
        println!("Project {project_id} is not mirrored by '{pair_id}'.");
        return Ok(());
    }
    super::local_store(home)?
        .remove_checkpoint(&pair.scope(project_id))
        .with_context(|| format!("failed to remove checkpoint of project {project_id}"))?;
    println!("✓ Removed project {project_id} from '{pair_id}'");
    Ok(())
}

fn list(home: &Path, pair_id: &str) -> Result<()> {
    let pair = registry::load_pair_at(home, &PairId::from(pair_id))
        .with_context(|| format!("failed to load pair '{pair_id}'"))?;
    if pair.mirrors.is_empty() {
        println!("Pair '{pair_id}' has no mirrors.");
        return Ok(());
    }

    let rows: Vec<MirrorRow> = pair
        .mirrors
        .iter()
        .map(|m| {
            let settings = resolve_for(&pair, m);
            MirrorRow {
                project: m.project_id.0,
                path: m.project_path.clone(),
                enabled: settings.enabled,
                issues: settings.mirror_issues,
                trigger: settings.trigger_update,
                branches: settings.branch_regex.unwrap_or_else(|| "*".to_string()),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

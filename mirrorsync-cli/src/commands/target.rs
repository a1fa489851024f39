//! `mirrorsync target add|list`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_core::{registry, CredentialHandle, RemoteTarget, TargetId};

#[derive(Subcommand, Debug)]
pub enum TargetCommand {
    /// Register (or replace) a remote instance.
    Add(AddArgs),
    /// List registered instances.
    List,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Target id (e.g. "gitlab-eu").
    pub id: String,

    /// API base URL, e.g. https://git.example.com/api/v4
    #[arg(long)]
    pub url: String,

    /// Environment variable holding the API token.
    #[arg(long = "token-env", value_name = "VAR")]
    pub token_env: String,

    #[arg(long)]
    pub label: Option<String>,
}

#[derive(Tabled)]
struct TargetRow {
    id: String,
    #[tabled(rename = "base url")]
    base_url: String,
    #[tabled(rename = "token env")]
    token_env: String,
    label: String,
}

pub fn run(cmd: TargetCommand) -> Result<()> {
    match cmd {
        TargetCommand::Add(args) => add(args),
        TargetCommand::List => list(),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let target = RemoteTarget {
        id: TargetId::from(args.id.clone()),
        base_url: args.url.trim_end_matches('/').to_string(),
        credential: CredentialHandle(args.token_env),
        label: args.label,
    };
    let home = super::home()?;
    registry::save_target_at(&home, &target)
        .with_context(|| format!("failed to save target '{}'", args.id))?;
    println!("✓ Saved target '{}' ({})", target.id, target.base_url);
    Ok(())
}

fn list() -> Result<()> {
    let home = super::home()?;
    let targets = registry::list_targets_at(&home).context("failed to load targets")?;
    if targets.is_empty() {
        println!("No targets registered.");
        println!("Run: mirrorsync target add <id> --url <base-url> --token-env <VAR>");
        return Ok(());
    }

    let rows: Vec<TargetRow> = targets
        .into_iter()
        .map(|t| TargetRow {
            id: t.id.0,
            base_url: t.base_url,
            token_env: t.credential.0,
            label: t.label.unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

//! `mirrorsync status`: checkpoint and due state per mirror.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_core::CheckpointStatus;
use mirrorsync_engine::{staleness::format_age, DueSignal, ScopeStatus};

/// Arguments for `mirrorsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Filter to a single pair.
    #[arg(long)]
    pub pair: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let scheduler = super::local_scheduler(&home)?;

        let mut scopes = scheduler
            .status()
            .context("failed to load status; run `mirrorsync init` first")?;
        if let Some(pair) = self.pair.as_ref() {
            scopes.retain(|s| s.scope.pair_id.0 == *pair);
        }

        if self.json {
            return print_json(scopes);
        }
        print_table(scopes);
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusReportJson {
    summary: StatusSummaryJson,
    scopes: Vec<ScopeStatus>,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    pairs: usize,
    mirrors: usize,
    due: usize,
    failing: usize,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "project")]
    project: u64,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
    #[tabled(rename = "failures")]
    failures: u32,
}

fn summarize(scopes: &[ScopeStatus]) -> StatusSummaryJson {
    let pairs: BTreeSet<&str> = scopes.iter().map(|s| s.scope.pair_id.0.as_str()).collect();
    StatusSummaryJson {
        pairs: pairs.len(),
        mirrors: scopes.len(),
        due: scopes.iter().filter(|s| s.due.is_due()).count(),
        failing: scopes
            .iter()
            .filter(|s| {
                s.checkpoint
                    .as_ref()
                    .is_some_and(|cp| cp.last_sync_status != CheckpointStatus::Succeeded)
            })
            .count(),
    }
}

fn print_json(scopes: Vec<ScopeStatus>) -> Result<()> {
    let payload = StatusReportJson {
        summary: summarize(&scopes),
        scopes,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(scopes: Vec<ScopeStatus>) {
    let summary = summarize(&scopes);
    println!(
        "mirrorsync v{} | {} pairs | {} mirrors | {} due | {} failing",
        env!("CARGO_PKG_VERSION"),
        summary.pairs,
        summary.mirrors,
        summary.due,
        summary.failing,
    );

    if scopes.is_empty() {
        println!("No mirrors configured.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    let mut grouped = BTreeMap::<String, Vec<ScopeStatus>>::new();
    for row in scopes {
        grouped
            .entry(format!("{} ({})", row.scope.pair_id, row.scope.direction))
            .or_default()
            .push(row);
    }

    println!("{separator}");
    println!(
        "Indicators: {} CURRENT  {} STALE  {} RETRY  {} BACKOFF  {} NEVER SYNCED  {} DISABLED",
        signal_indicator(&DueSignal::Current),
        signal_indicator(&DueSignal::Stale {
            reason: String::new(),
        }),
        signal_indicator(&DueSignal::RetryDue {
            last: CheckpointStatus::Failed,
        }),
        signal_indicator(&DueSignal::Backoff { retry_in_secs: 0 }),
        signal_indicator(&DueSignal::NeverSynced),
        signal_indicator(&DueSignal::Disabled),
    );
    println!("{separator}");
    for (pair, rows) in grouped {
        println!("{}", pair.to_uppercase().bold());
        let table_rows: Vec<StatusTableRow> = rows
            .into_iter()
            .map(|row| StatusTableRow {
                project: row.scope.project_id.0,
                status: if row.running {
                    format!("{} RUNNING", signal_indicator(&row.due))
                } else {
                    format!("{} {}", signal_indicator(&row.due), signal_label(&row.due))
                },
                detail: signal_detail(&row),
                last_sync: row
                    .checkpoint
                    .as_ref()
                    .map(|cp| format_age(cp.last_sync_at))
                    .unwrap_or_else(|| "never".to_string()),
                failures: row
                    .checkpoint
                    .as_ref()
                    .map(|cp| cp.consecutive_failures)
                    .unwrap_or(0),
            })
            .collect();
        let mut table = Table::new(table_rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{separator}");
    }

    if summary.due > 0 {
        println!("Run 'mirrorsync sync <pair>' or start the daemon to catch up.");
    }
}

fn signal_label(signal: &DueSignal) -> &'static str {
    match signal {
        DueSignal::NeverSynced => "NEVER SYNCED",
        DueSignal::Modified => "MODIFIED",
        DueSignal::RetryDue { .. } => "RETRY",
        DueSignal::Stale { .. } => "STALE",
        DueSignal::Backoff { .. } => "BACKOFF",
        DueSignal::Current => "CURRENT",
        DueSignal::Disabled => "DISABLED",
    }
}

fn signal_indicator(signal: &DueSignal) -> String {
    match signal {
        DueSignal::NeverSynced => "■".bright_black().bold().to_string(),
        DueSignal::Current => "■".green().bold().to_string(),
        DueSignal::Stale { .. } | DueSignal::Modified => "■".yellow().bold().to_string(),
        DueSignal::RetryDue { .. } => "■".red().bold().to_string(),
        DueSignal::Backoff { .. } => "■".magenta().bold().to_string(),
        DueSignal::Disabled => "■".white().dimmed().to_string(),
    }
}

fn signal_detail(row: &ScopeStatus) -> String {
    match &row.due {
        DueSignal::NeverSynced => "no checkpoint".to_string(),
        DueSignal::Modified => "settings changed".to_string(),
        DueSignal::Stale { reason } => reason.clone(),
        DueSignal::Backoff { retry_in_secs } => format!("retry in {retry_in_secs}s"),
        DueSignal::Current => "up to date".to_string(),
        DueSignal::Disabled => "disabled".to_string(),
        DueSignal::RetryDue { last } => match row.checkpoint.as_ref().and_then(|cp| cp.last_error.as_ref()) {
            Some(error) => format!("{last}: {}", error.message),
            None => last.to_string(),
        },
    }
}

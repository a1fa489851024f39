//! `mirrorsync conflicts`: reverse-direction runs the daemon held back.

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_core::ConflictRecord;
use mirrorsync_daemon::{request_conflicts, DaemonError};
use mirrorsync_engine::staleness::format_age;

#[derive(Args, Debug)]
pub struct ConflictsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ConflictRow {
    held: String,
    #[tabled(rename = "blocked by")]
    blocking: String,
    job: String,
    age: String,
}

impl ConflictsArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let data = match request_conflicts(&home) {
            Ok(data) => data,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                if self.json {
                    println!("[]");
                } else {
                    println!("daemon is not running; conflicts are only tracked while it runs");
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query conflicts"),
        };

        let records: Vec<ConflictRecord> =
            serde_json::from_value(data).context("daemon returned unreadable conflicts")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&records).context("failed to serialize conflicts")?
            );
            return Ok(());
        }
        if records.is_empty() {
            println!("No conflicts recorded.");
            return Ok(());
        }

        let rows: Vec<ConflictRow> = records
            .into_iter()
            .map(|r| ConflictRow {
                held: r.held.to_string(),
                blocking: r.blocking.to_string(),
                job: r.blocking_job.0,
                age: format_age(r.detected_at),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

//! `mirrorsync sync`: run one mirror, or a whole pair, now.
//!
//! When the daemon is up the request goes over its socket so runs stay
//! serialized against the daemon's own ticks. Otherwise the sync runs in
//! this process against the same on-disk state, after finalizing jobs a
//! dead process left unfinished. `--local` is refused while a daemon
//! answers, since two schedulers would race on that state.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use mirrorsync_core::{JobStatus, PairId, ProjectId, ScopeKey};
use mirrorsync_daemon::{
    init_tracing, request_batch, request_sync, send_request, DaemonError, DaemonRequest,
};
use mirrorsync_engine::{BatchResult, EngineError, RunReport, Scheduler};

/// Arguments for `mirrorsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Pair to sync.
    pub pair: String,

    /// Sync only this project; omit to sync every mirror of the pair.
    #[arg(long)]
    pub project: Option<u64>,

    /// Run in this process instead of through the daemon. Refused while
    /// the daemon is running.
    #[arg(long)]
    pub local: bool,

    /// Emit the raw report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Log engine activity to stderr.
    #[arg(long, short)]
    pub verbose: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        if self.verbose {
            init_tracing();
        }

        if self.local {
            if send_request(&home, &DaemonRequest::new("status")).is_ok() {
                bail!(
                    "the daemon is running; sync without --local, or stop it with `mirrorsync daemon stop`"
                );
            }
        } else {
            match self.via_daemon(&home) {
                Ok(report) => return self.print_remote(report),
                Err(DaemonError::DaemonNotRunning { .. }) => {}
                Err(err) => return Err(err).context("daemon rejected sync request"),
            }
        }
        self.run_local(&home)
    }

    fn via_daemon(&self, home: &Path) -> Result<Value, DaemonError> {
        match self.project {
            Some(project) => request_sync(home, &self.pair, project),
            None => request_batch(home, &self.pair),
        }
    }

    fn run_local(&self, home: &Path) -> Result<()> {
        let scheduler = super::local_scheduler(home)?;
        let recovered = scheduler
            .recover()
            .context("failed to finalize interrupted jobs")?;
        if recovered > 0 {
            eprintln!(
                "{} finalized {recovered} job(s) left unfinished by a previous process",
                "■".yellow()
            );
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let pair_id = PairId::from(self.pair.clone());

        match self.project {
            Some(project) => {
                let scope = scheduler
                    .scope_for(&pair_id, ProjectId(project))
                    .with_context(|| format!("project {project} is not mirrored by '{}'", self.pair))?;
                let report = runtime
                    .block_on(sync_one(&scheduler, &scope))
                    .with_context(|| format!("sync failed for {scope}"))?;
                if self.json {
                    return print_json(&report);
                }
                print_run(&report)
            }
            None => {
                let result = runtime
                    .block_on(scheduler.trigger_batch(&pair_id))
                    .with_context(|| format!("batch sync failed for '{}'", self.pair))?;
                if self.json {
                    return print_json(&result);
                }
                print_batch(&self.pair, &result)
            }
        }
    }

    fn print_remote(&self, report: Value) -> Result<()> {
        if self.json {
            return print_json(&report);
        }
        match self.project {
            Some(_) => {
                let report: RunReport = serde_json::from_value(report)
                    .context("daemon returned an unreadable run report")?;
                print_run(&report)
            }
            None => {
                let result: BatchResult = serde_json::from_value(report)
                    .context("daemon returned an unreadable batch result")?;
                print_batch(&self.pair, &result)
            }
        }
    }
}

async fn sync_one(scheduler: &Scheduler, scope: &ScopeKey) -> Result<RunReport, EngineError> {
    scheduler.trigger_sync(scope)?.wait().await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize sync report")?
    );
    Ok(())
}

fn print_run(report: &RunReport) -> Result<()> {
    match report {
        RunReport::Completed(job) => match job.status {
            JobStatus::Succeeded => println!("{} {} synced", "✓".green(), job.scope),
            status => {
                let detail = job
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.category, e.message))
                    .unwrap_or_default();
                println!("{} {} {status} ({detail})", "✗".red(), job.scope);
                bail!("sync of {} ended {status}", job.scope);
            }
        },
        RunReport::Skipped { scope, .. } => {
            println!("{} {scope} is already running", "■".yellow());
        }
        RunReport::Held(record) => {
            println!(
                "{} {} held: {} (blocked by {})",
                "■".yellow(),
                record.held,
                record.reason,
                record.blocking
            );
        }
    }
    Ok(())
}

fn print_batch(pair: &str, result: &BatchResult) -> Result<()> {
    println!(
        "'{pair}': {} succeeded, {} partial, {} skipped, {} failed in {}ms",
        result.succeeded, result.partial, result.skipped, result.failed, result.duration_ms
    );
    for item in &result.per_item_errors {
        println!("  {} {} [{}] {}", "✗".red(), item.scope, item.category, item.message);
    }
    for item in &result.skipped_items {
        println!("  {} {} skipped", "■".yellow(), item.scope);
    }
    if result.failed > 0 {
        bail!("{} of {} mirrors failed", result.failed, result.total());
    }
    Ok(())
}

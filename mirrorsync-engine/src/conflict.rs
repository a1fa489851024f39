//! Cross-instance conflict detection.
//!
//! Two scopes conflict when one moves project `P` from instance `X` to `Y`
//! and the other moves `P` from `Y` back to `X` with overlapping run windows.
//! Matching is keyed on both instance ids *and* the project id; the same
//! numeric project id is reused across unrelated instances.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use mirrorsync_core::{ConflictConfig, ConflictRecord, ScopeKey, SyncJob, TargetId, TieBreak};

const MAX_WINDOW_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: Duration,
    /// How long an unfinished job can still be live: the run timeout plus
    /// the window. Older unfinished journal entries were left by a process
    /// that died before finalizing.
    live_for: Duration,
}

impl ConflictDetector {
    pub fn new(config: &ConflictConfig, run_timeout: std::time::Duration) -> Self {
        // Clamp to something chrono can represent.
        let secs = config.window_secs.min(MAX_WINDOW_SECS) as i64;
        let timeout_secs = run_timeout.as_secs().min(MAX_WINDOW_SECS) as i64;
        Self {
            window: Duration::seconds(secs),
            live_for: Duration::seconds(secs + timeout_secs),
        }
    }

    /// Find a job blocking a candidate run of `scope` (moving `source → target`)
    /// that would start at `now`.
    ///
    /// A job's window is `[started_at, finished_at + window]`. An unfinished
    /// job's window runs to `started_at + run_timeout + window`. The candidate
    /// is the later arrival and is the one held.
    pub fn check<'a>(
        &self,
        scope: &ScopeKey,
        source: &TargetId,
        target: &TargetId,
        jobs: impl IntoIterator<Item = &'a SyncJob>,
        now: DateTime<Utc>,
    ) -> Option<ConflictRecord> {
        let blocking = jobs.into_iter().find(|job| {
            job.scope.project_id == scope.project_id
                && &job.source_instance_id == target
                && &job.target_instance_id == source
                && self.window_contains(job, now)
        })?;

        Some(ConflictRecord {
            held: scope.clone(),
            blocking: blocking.scope.clone(),
            blocking_job: blocking.id.clone(),
            source_instance_id: source.clone(),
            target_instance_id: target.clone(),
            project_id: scope.project_id,
            detected_at: now,
            reason: format!(
                "reverse sync {} of project {} is within the conflict window",
                blocking.scope, scope.project_id
            ),
        })
    }

    fn window_contains(&self, job: &SyncJob, at: DateTime<Utc>) -> bool {
        if at < job.started_at {
            return false;
        }
        let end = match job.finished_at {
            Some(finished_at) if job.status.is_terminal() => finished_at + self.window,
            _ if job.status.is_terminal() => job.started_at + self.window,
            _ => job.started_at + self.live_for,
        };
        at <= end
    }
}

/// Stable-sort due scopes so reverse scopes due in the same tick are admitted
/// in tie-break order. `FirstConfigured` leaves the order untouched.
pub fn order_due<T>(items: &mut [T], tie_break: TieBreak, scope: impl Fn(&T) -> &ScopeKey) {
    items.sort_by_key(|item| tie_break.rank(scope(item).direction));
}

/// Broadcast stream of conflict records, plus a bounded recent history.
#[derive(Debug)]
pub struct ConflictLog {
    tx: broadcast::Sender<ConflictRecord>,
    recent: Mutex<VecDeque<ConflictRecord>>,
    capacity: usize,
}

impl ConflictLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn publish(&self, record: ConflictRecord) {
        tracing::warn!(
            held = %record.held,
            blocking = %record.blocking,
            job = %record.blocking_job,
            project = %record.project_id,
            "conflict, run held",
        );
        {
            let mut recent = self
                .recent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.capacity > 0 {
                while recent.len() >= self.capacity {
                    recent.pop_front();
                }
                recent.push_back(record.clone());
            }
        }
        // No subscribers is fine.
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictRecord> {
        self.tx.subscribe()
    }

    /// Recent records, oldest first.
    pub fn recent(&self) -> Vec<ConflictRecord> {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

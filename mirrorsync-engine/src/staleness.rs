//! Due-work discovery.
//!
//! Signal precedence for one scope:
//! 1. `Disabled` (disabled mirror with nothing left to tear down)
//! 2. `NeverSynced` (no checkpoint)
//! 3. `Modified` (effective settings digest differs from the checkpoint)
//! 4. `RetryDue` / `Backoff` (last run failed or was partial)
//! 5. `Stale` (last success older than the pair's sync interval)
//! 6. `Current`

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use mirrorsync_core::settings::resolve_for;
use mirrorsync_core::{Checkpoint, CheckpointStatus, EffectiveSettings, ScopeKey, SyncPair};

use crate::error::EngineError;
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DueSignal {
    NeverSynced,
    Modified,
    RetryDue { last: CheckpointStatus },
    Stale { reason: String },
    /// Failed recently; waiting out the retry delay.
    Backoff { retry_in_secs: u64 },
    Current,
    Disabled,
}

impl DueSignal {
    pub fn is_due(&self) -> bool {
        matches!(
            self,
            DueSignal::NeverSynced
                | DueSignal::Modified
                | DueSignal::RetryDue { .. }
                | DueSignal::Stale { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DueSignal::NeverSynced => "never_synced",
            DueSignal::Modified => "modified",
            DueSignal::RetryDue { .. } => "retry_due",
            DueSignal::Stale { .. } => "stale",
            DueSignal::Backoff { .. } => "backoff",
            DueSignal::Current => "current",
            DueSignal::Disabled => "disabled",
        }
    }
}

/// One scope with its evaluated signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeAssessment {
    pub scope: ScopeKey,
    pub signal: DueSignal,
    pub checkpoint: Option<Checkpoint>,
}

/// SHA-256 hex digest of resolved settings.
pub fn settings_digest(settings: &EffectiveSettings) -> String {
    let encoded = serde_json::to_vec(settings).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
}

/// Classify one scope.
pub fn check(
    settings: &EffectiveSettings,
    checkpoint: Option<&Checkpoint>,
    sync_interval: Duration,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> DueSignal {
    let Some(checkpoint) = checkpoint else {
        return if settings.enabled {
            DueSignal::NeverSynced
        } else {
            DueSignal::Disabled
        };
    };

    // A digest change on a disabled mirror is still due: the run deletes it.
    if checkpoint.settings_digest.as_deref() != Some(settings_digest(settings).as_str()) {
        return DueSignal::Modified;
    }
    if !settings.enabled {
        return DueSignal::Disabled;
    }

    let age = now
        .signed_duration_since(checkpoint.last_sync_at)
        .to_std()
        .unwrap_or_default();

    match checkpoint.last_sync_status {
        CheckpointStatus::Failed | CheckpointStatus::Partial => {
            if age >= retry_delay {
                DueSignal::RetryDue {
                    last: checkpoint.last_sync_status,
                }
            } else {
                DueSignal::Backoff {
                    retry_in_secs: (retry_delay - age).as_secs(),
                }
            }
        }
        CheckpointStatus::Succeeded => {
            if age >= sync_interval {
                DueSignal::Stale {
                    reason: format!("last synced {} ago", format_seconds(age.as_secs())),
                }
            } else {
                DueSignal::Current
            }
        }
    }
}

/// Evaluate every configured scope of `pairs`, in configuration order.
pub fn assess(
    pairs: &[SyncPair],
    store: &dyn StateStore,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<ScopeAssessment>, EngineError> {
    let mut out = Vec::new();
    for pair in pairs {
        let checkpoints = store.load_checkpoints(&pair.id)?;
        let interval = Duration::from_secs(pair.sync_interval_secs);
        for mirror in &pair.mirrors {
            let scope = pair.scope(mirror.project_id);
            let settings = resolve_for(pair, mirror);
            let checkpoint = checkpoints.iter().find(|cp| cp.scope == scope).cloned();
            let signal = check(&settings, checkpoint.as_ref(), interval, retry_delay, now);
            out.push(ScopeAssessment {
                scope,
                signal,
                checkpoint,
            });
        }
    }
    Ok(out)
}

/// The due subset of [`assess`].
pub fn discover(
    pairs: &[SyncPair],
    store: &dyn StateStore,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<ScopeAssessment>, EngineError> {
    let mut all = assess(pairs, store, retry_delay, now)?;
    all.retain(|a| a.signal.is_due());
    Ok(all)
}

/// Format age from a chrono timestamp, e.g. `5m`.
pub fn format_age(timestamp: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(timestamp).num_seconds().max(0) as u64;
    format_seconds(age)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

//! Domain types for mirrorsync.
//!
//! All types are serializable/deserializable via serde; configuration types
//! round-trip through serde_yaml, state types through serde_json.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::MirrorOptions;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identity of one remote source-control instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of one configured sync pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairId(pub String);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PairId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PairId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Numeric project id on a remote instance.
///
/// Only unique within one instance: two targets routinely reuse the same id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for ProjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of one sync job (one execution attempt for a scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque credential reference. The core never looks inside; the HTTP client
/// resolves it as the name of an environment variable holding a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialHandle(pub String);

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Declared direction of a sync pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Push,
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => write!(f, "push"),
            Direction::Pull => write!(f, "pull"),
        }
    }
}

/// Lifecycle status of a [`SyncJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Partial
        )
    }

    /// The persisted checkpoint status for a terminal job status.
    pub fn terminal(self) -> Option<CheckpointStatus> {
        match self {
            JobStatus::Succeeded => Some(CheckpointStatus::Succeeded),
            JobStatus::Failed => Some(CheckpointStatus::Failed),
            JobStatus::Partial => Some(CheckpointStatus::Partial),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Persisted last-sync status of a checkpoint.
///
/// Terminal values only. "Currently running" lives in the task registry and is
/// never written here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Succeeded,
    Failed,
    Partial,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointStatus::Succeeded => "succeeded",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Circuit breaker state for one remote target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Stable, operator-facing error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    RateLimited,
    CircuitOpen,
    Timeout,
    Interrupted,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Interrupted => "interrupted",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Configuration structs
// ---------------------------------------------------------------------------

/// One remote source-control instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub id: TargetId,
    /// API base address, e.g. `https://git.example.com`.
    pub base_url: String,
    pub credential: CredentialHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Group-level option overrides, keyed by namespace path (`a/b/c`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub path: String,
    #[serde(default)]
    pub overrides: MirrorOptions,
}

/// One mirrored project within a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub project_id: ProjectId,
    /// Full namespace path of the project on the source instance.
    pub project_path: String,
    #[serde(default)]
    pub overrides: MirrorOptions,
}

impl MirrorConfig {
    /// Namespace path of the group containing this project, if any.
    pub fn group_path(&self) -> Option<&str> {
        self.project_path.rsplit_once('/').map(|(group, _)| group)
    }
}

/// Ordered pair of targets with a declared direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPair {
    pub id: PairId,
    pub source: TargetId,
    pub target: TargetId,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub defaults: MirrorOptions,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    /// A scope with a successful checkpoint older than this is due again.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_sync_interval_secs() -> u64 {
    3600
}

impl SyncPair {
    pub fn scope(&self, project_id: ProjectId) -> ScopeKey {
        ScopeKey {
            pair_id: self.id.clone(),
            direction: self.direction,
            project_id,
        }
    }

    pub fn mirror(&self, project_id: ProjectId) -> Option<&MirrorConfig> {
        self.mirrors.iter().find(|m| m.project_id == project_id)
    }

    /// True when `other` links the same two targets the opposite way round.
    pub fn is_reverse_of(&self, other: &SyncPair) -> bool {
        self.source == other.target && self.target == other.source
    }
}

// ---------------------------------------------------------------------------
// State structs
// ---------------------------------------------------------------------------

/// The logical unit of work: `(pair, direction, remote project)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub pair_id: PairId,
    pub direction: Direction,
    pub project_id: ProjectId,
}

impl ScopeKey {
    pub fn new(pair_id: impl Into<PairId>, direction: Direction, project_id: u64) -> Self {
        Self {
            pair_id: pair_id.into(),
            direction,
            project_id: ProjectId(project_id),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pair_id, self.direction, self.project_id)
    }
}

/// Safe, operator-visible failure summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub category: ErrorCategory,
    pub message: String,
}

impl JobError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// One execution attempt for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub scope: ScopeKey,
    pub source_instance_id: TargetId,
    pub target_instance_id: TargetId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default)]
    pub retry_count: u32,
}

impl SyncJob {
    /// Move the job to a terminal status. Non-terminal statuses are ignored.
    pub fn finish(&mut self, status: JobStatus, error: Option<JobError>, at: DateTime<Utc>) {
        if !status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(at);
    }
}

/// Durable progress marker per scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scope: ScopeKey,
    /// Next issue page to fetch; `None` when no paging is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u32>,
    pub last_sync_status: CheckpointStatus,
    pub last_sync_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Remote mirror id returned by the upsert, used for later deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_id: Option<u64>,
}

/// Two scopes that would race on the same resource from opposite directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The later-arriving scope that was not started.
    pub held: ScopeKey,
    /// The scope whose job window blocks it.
    pub blocking: ScopeKey,
    pub blocking_job: JobId,
    pub source_instance_id: TargetId,
    pub target_instance_id: TargetId,
    pub project_id: ProjectId,
    pub detected_at: DateTime<Utc>,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: &str, source: &str, target: &str) -> SyncPair {
        let now = Utc::now();
        SyncPair {
            id: PairId::from(id),
            source: TargetId::from(source),
            target: TargetId::from(target),
            direction: Direction::Push,
            defaults: MirrorOptions::default(),
            groups: vec![],
            mirrors: vec![],
            sync_interval_secs: default_sync_interval_secs(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn newtype_display() {
        assert_eq!(TargetId::from("gl-a").to_string(), "gl-a");
        assert_eq!(PairId::from("a-to-b").to_string(), "a-to-b");
        assert_eq!(ProjectId(7).to_string(), "7");
    }

    #[test]
    fn scope_key_display_includes_all_parts() {
        let key = ScopeKey::new("a-to-b", Direction::Pull, 42);
        assert_eq!(key.to_string(), "a-to-b/pull/42");
    }

    #[test]
    fn only_finished_statuses_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert_eq!(JobStatus::Running.terminal(), None);
        assert_eq!(
            JobStatus::Partial.terminal(),
            Some(CheckpointStatus::Partial)
        );
    }

    #[test]
    fn finish_ignores_non_terminal_status() {
        let now = Utc::now();
        let mut job = SyncJob {
            id: JobId::from("j1"),
            scope: ScopeKey::new("p", Direction::Push, 1),
            source_instance_id: TargetId::from("a"),
            target_instance_id: TargetId::from("b"),
            status: JobStatus::Running,
            started_at: now,
            finished_at: None,
            error: None,
            retry_count: 0,
        };
        job.finish(JobStatus::Pending, None, now);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.finished_at.is_none());

        job.finish(JobStatus::Failed, None, now);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.finished_at, Some(now));
    }

    #[test]
    fn group_path_is_parent_namespace() {
        let mirror = MirrorConfig {
            project_id: ProjectId(1),
            project_path: "platform/backend/api".to_string(),
            overrides: MirrorOptions::default(),
        };
        assert_eq!(mirror.group_path(), Some("platform/backend"));

        let top = MirrorConfig {
            project_path: "api".to_string(),
            ..mirror
        };
        assert_eq!(top.group_path(), None);
    }

    #[test]
    fn reverse_pair_detection() {
        let forward = pair("a-to-b", "a", "b");
        let reverse = pair("b-to-a", "b", "a");
        let unrelated = pair("c-to-d", "c", "d");
        assert!(forward.is_reverse_of(&reverse));
        assert!(!forward.is_reverse_of(&unrelated));
    }

    #[test]
    fn pair_serde_roundtrip_applies_defaults() {
        let yaml = r#"
id: a-to-b
source: a
target: b
created_at: 2024-01-01T00:00:00Z
updated_at: 2024-01-01T00:00:00Z
"#;
        let parsed: SyncPair = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(parsed.direction, Direction::Push);
        assert_eq!(parsed.sync_interval_secs, 3600);
        assert!(parsed.mirrors.is_empty());

        let out = serde_yaml::to_string(&parsed).expect("serialize");
        let back: SyncPair = serde_yaml::from_str(&out).expect("reparse");
        assert_eq!(back, parsed);
    }
}

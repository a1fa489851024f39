//! The seam between the engine and a remote instance.
//!
//! Expected outcomes (throttling, not-found, outages) are values of
//! [`OperationResult`], never errors, so callers match on them exhaustively.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mirrorsync_core::{Direction, EffectiveSettings, ProjectId, RemoteTarget};

/// One remote call, with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOperation {
    /// Create the mirror, or update it in place when `mirror_id` is known.
    UpsertMirror {
        project_id: ProjectId,
        direction: Direction,
        mirror_id: Option<u64>,
        /// Clone URL of the peer project.
        peer_url: String,
        settings: EffectiveSettings,
    },
    /// Ask the instance to run the mirror now.
    TriggerUpdate {
        project_id: ProjectId,
        direction: Direction,
        mirror_id: u64,
    },
    DeleteMirror {
        project_id: ProjectId,
        direction: Direction,
        mirror_id: u64,
    },
    /// Import one page of issues from the peer into this instance.
    SyncIssues {
        project_id: ProjectId,
        source_url: String,
        page: u32,
        per_page: u32,
    },
}

impl RemoteOperation {
    /// Short stable name, safe for operator-facing messages.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteOperation::UpsertMirror { .. } => "upsert_mirror",
            RemoteOperation::TriggerUpdate { .. } => "trigger_update",
            RemoteOperation::DeleteMirror { .. } => "delete_mirror",
            RemoteOperation::SyncIssues { .. } => "sync_issues",
        }
    }

    /// HTTP method used by [`crate::HttpRemoteClient`].
    pub fn method(&self) -> &'static str {
        match self {
            RemoteOperation::UpsertMirror {
                direction: Direction::Push,
                mirror_id: None,
                ..
            } => "POST",
            RemoteOperation::UpsertMirror { .. } => "PUT",
            RemoteOperation::TriggerUpdate { .. } => "POST",
            RemoteOperation::DeleteMirror {
                direction: Direction::Push,
                ..
            } => "DELETE",
            RemoteOperation::DeleteMirror { .. } => "PUT",
            RemoteOperation::SyncIssues { .. } => "POST",
        }
    }

    /// Request path relative to the target's base URL.
    ///
    /// Push mirrors live under the source project's `remote_mirrors`; pull
    /// mirrors are attributes of the target project itself.
    pub fn path(&self) -> String {
        match self {
            RemoteOperation::UpsertMirror {
                project_id,
                direction: Direction::Push,
                mirror_id,
                ..
            } => match mirror_id {
                Some(id) => format!("/api/v4/projects/{project_id}/remote_mirrors/{id}"),
                None => format!("/api/v4/projects/{project_id}/remote_mirrors"),
            },
            RemoteOperation::UpsertMirror { project_id, .. } => {
                format!("/api/v4/projects/{project_id}")
            }
            RemoteOperation::TriggerUpdate {
                project_id,
                direction: Direction::Push,
                mirror_id,
            } => format!("/api/v4/projects/{project_id}/remote_mirrors/{mirror_id}/sync"),
            RemoteOperation::TriggerUpdate { project_id, .. } => {
                format!("/api/v4/projects/{project_id}/mirror/pull")
            }
            RemoteOperation::DeleteMirror {
                project_id,
                direction: Direction::Push,
                mirror_id,
            } => format!("/api/v4/projects/{project_id}/remote_mirrors/{mirror_id}"),
            RemoteOperation::DeleteMirror { project_id, .. } => {
                format!("/api/v4/projects/{project_id}")
            }
            RemoteOperation::SyncIssues { project_id, .. } => {
                format!("/api/v4/projects/{project_id}/issues/sync")
            }
        }
    }

    /// JSON body, if the request carries one.
    pub fn body(&self) -> Option<Value> {
        match self {
            RemoteOperation::UpsertMirror {
                direction: Direction::Push,
                peer_url,
                settings,
                ..
            } => Some(json!({
                "url": peer_url,
                "enabled": settings.enabled,
                "only_protected_branches": settings.only_protected_branches,
                "keep_divergent_refs": settings.keep_divergent_refs,
                "mirror_branch_regex": settings.branch_regex,
            })),
            RemoteOperation::UpsertMirror {
                peer_url, settings, ..
            } => Some(json!({
                "import_url": peer_url,
                "mirror": settings.enabled,
                "mirror_overwrites_diverged_branches": settings.overwrite_diverged,
                "only_mirror_protected_branches": settings.only_protected_branches,
                "mirror_branch_regex": settings.branch_regex,
            })),
            RemoteOperation::DeleteMirror {
                direction: Direction::Pull,
                ..
            } => Some(json!({ "mirror": false })),
            RemoteOperation::SyncIssues {
                source_url,
                page,
                per_page,
                ..
            } => Some(json!({
                "source_url": source_url,
                "page": page,
                "per_page": per_page,
            })),
            RemoteOperation::TriggerUpdate { .. } | RemoteOperation::DeleteMirror { .. } => None,
        }
    }
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classified result of one remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Ok(Value),
    /// The remote asked us to slow down ("too many requests").
    RateLimited { retry_after: Option<Duration> },
    /// Timeout, connection failure, or 5xx. Worth retrying.
    TransientError(String),
    /// Not-found, auth failure, or validation rejection. Never retried.
    PermanentError(String),
}

/// Performs the actual network call for one operation against one target.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn invoke(&self, target: &RemoteTarget, operation: &RemoteOperation) -> OperationResult;
}

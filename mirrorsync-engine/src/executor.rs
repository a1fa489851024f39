//! The remote operation sequence for one scope.
//!
//! ```text
//! disabled? ── yes ──▶ DeleteMirror (if a mirror id is recorded) ──▶ done
//!    │ no
//!    ▼
//! UpsertMirror ── fails ──▶ failed
//!    ▼
//! TriggerUpdate (trigger_update) ── fails ──▶ partial
//!    ▼
//! SyncIssues page loop from the cursor (mirror_issues) ── fails ──▶ partial
//! ```
//!
//! Every call goes through the [`RateLimiter`]. The executor never touches the
//! terminal checkpoint; it returns a [`RunOutcome`] and the scheduler
//! finalizes.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use mirrorsync_core::{
    Checkpoint, Direction, EffectiveSettings, ErrorCategory, JobError, JobId, JobStatus,
    MirrorConfig, RemoteTarget, ScopeKey,
};

use crate::limiter::{CallOutcome, RateLimiter};
use crate::remote::{RemoteClient, RemoteOperation};
use crate::store::StateStore;

/// Issues requested per page.
pub const ISSUES_PER_PAGE: u32 = 100;

/// Everything one run needs, captured at admission time.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub job_id: JobId,
    pub scope: ScopeKey,
    pub mirror: MirrorConfig,
    pub source: RemoteTarget,
    pub target: RemoteTarget,
    pub settings: EffectiveSettings,
    /// Checkpoint as it stood when the run was admitted.
    pub checkpoint: Option<Checkpoint>,
}

impl RunPlan {
    /// The instance that owns the mirror configuration: the source for push
    /// mirrors, the target for pull mirrors.
    pub fn home(&self) -> &RemoteTarget {
        match self.scope.direction {
            Direction::Push => &self.source,
            Direction::Pull => &self.target,
        }
    }

    /// Clone URL of the project on the other side.
    pub fn peer_url(&self) -> String {
        let peer = match self.scope.direction {
            Direction::Push => &self.target,
            Direction::Pull => &self.source,
        };
        format!(
            "{}/{}.git",
            peer.base_url.trim_end_matches('/'),
            self.mirror.project_path
        )
    }

    fn source_project_url(&self) -> String {
        format!(
            "{}/{}",
            self.source.base_url.trim_end_matches('/'),
            self.mirror.project_path
        )
    }

    fn recorded_mirror_id(&self) -> Option<u64> {
        self.checkpoint.as_ref().and_then(|cp| cp.mirror_id)
    }
}

/// Result of one run, before finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub retries: u32,
    pub mirror_id: Option<u64>,
    /// Issue page to resume from; `None` once paging completes.
    pub cursor: Option<u32>,
}

/// Cursor sink for a run. Once abandoned (the scheduler gave up waiting), no
/// further writes reach the store.
#[derive(Clone)]
pub struct Progress {
    store: Arc<dyn StateStore>,
    scope: ScopeKey,
    abandoned: Arc<Mutex<bool>>,
}

impl Progress {
    pub fn new(store: Arc<dyn StateStore>, scope: ScopeKey) -> Self {
        Self {
            store,
            scope,
            abandoned: Arc::new(Mutex::new(false)),
        }
    }

    /// Block all later writes. Waits for a write already in progress.
    pub fn abandon(&self) {
        *self
            .abandoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }

    pub fn is_abandoned(&self) -> bool {
        *self
            .abandoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist the next page to fetch. Only an existing checkpoint is
    /// updated; a first run keeps its cursor in the outcome.
    pub fn save_cursor(&self, cursor: Option<u32>) {
        let abandoned = self
            .abandoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *abandoned {
            tracing::debug!(scope = %self.scope, "run abandoned, progress discarded");
            return;
        }
        let result = self.store.load_checkpoint(&self.scope).and_then(|existing| {
            let Some(mut checkpoint) = existing else {
                return Ok(());
            };
            checkpoint.cursor = cursor;
            checkpoint.last_progress_at = Some(Utc::now());
            self.store.save_checkpoint(&checkpoint)
        });
        if let Err(err) = result {
            tracing::warn!(scope = %self.scope, error = %err, "failed to persist progress");
        }
    }
}

/// Run the operation sequence for `plan`.
pub async fn execute(
    plan: &RunPlan,
    limiter: &RateLimiter,
    client: &dyn RemoteClient,
    progress: &Progress,
) -> RunOutcome {
    let mut run = Run {
        plan,
        limiter,
        client,
        progress,
        retries: 0,
    };
    let prior_cursor = plan.checkpoint.as_ref().and_then(|cp| cp.cursor);

    if !plan.settings.enabled {
        return run.teardown().await;
    }

    let mirror_id = match run.upsert().await {
        Ok(id) => id,
        Err(error) => {
            return RunOutcome {
                status: JobStatus::Failed,
                error: Some(error),
                retries: run.retries,
                mirror_id: plan.recorded_mirror_id(),
                cursor: prior_cursor,
            }
        }
    };

    let mut partial: Option<JobError> = None;

    if plan.settings.trigger_update {
        let op = RemoteOperation::TriggerUpdate {
            project_id: plan.scope.project_id,
            direction: plan.scope.direction,
            mirror_id,
        };
        if let Err(error) = run.call(plan.home(), &op).await {
            partial = Some(error);
        }
    }

    let mut cursor = prior_cursor;
    if plan.settings.mirror_issues {
        match run.sync_issues(prior_cursor.unwrap_or(1)).await {
            Ok(()) => cursor = None,
            Err((page, error)) => {
                cursor = Some(page);
                partial.get_or_insert(error);
            }
        }
    }

    RunOutcome {
        status: if partial.is_some() {
            JobStatus::Partial
        } else {
            JobStatus::Succeeded
        },
        error: partial,
        retries: run.retries,
        mirror_id: Some(mirror_id),
        cursor,
    }
}

struct Run<'a> {
    plan: &'a RunPlan,
    limiter: &'a RateLimiter,
    client: &'a dyn RemoteClient,
    progress: &'a Progress,
    retries: u32,
}

impl Run<'_> {
    async fn call(
        &mut self,
        on: &RemoteTarget,
        op: &RemoteOperation,
    ) -> Result<Value, JobError> {
        if self.progress.is_abandoned() {
            tracing::debug!(job = %self.plan.job_id, op = %op, "run abandoned, call not issued");
            return Err(JobError::new(
                ErrorCategory::Timeout,
                format!("{op} abandoned for {}", self.plan.mirror.project_path),
            ));
        }
        let outcome = self.limiter.execute(self.client, on, op).await;
        self.retries += outcome.retries();
        match outcome {
            CallOutcome::Completed { payload, .. } => Ok(payload),
            other => {
                let category = other.category().unwrap_or(ErrorCategory::Internal);
                tracing::warn!(
                    job = %self.plan.job_id,
                    scope = %self.plan.scope,
                    op = %op,
                    category = %category,
                    "remote operation failed",
                );
                Err(JobError::new(
                    category,
                    format!("{op} failed for {}", self.plan.mirror.project_path),
                ))
            }
        }
    }

    async fn teardown(&mut self) -> RunOutcome {
        let plan = self.plan;
        let mut outcome = RunOutcome {
            status: JobStatus::Succeeded,
            error: None,
            retries: 0,
            mirror_id: None,
            cursor: None,
        };
        if let Some(mirror_id) = plan.recorded_mirror_id() {
            let op = RemoteOperation::DeleteMirror {
                project_id: plan.scope.project_id,
                direction: plan.scope.direction,
                mirror_id,
            };
            if let Err(error) = self.call(plan.home(), &op).await {
                outcome.status = JobStatus::Failed;
                outcome.error = Some(error);
                outcome.mirror_id = Some(mirror_id);
            }
        }
        outcome.retries = self.retries;
        outcome
    }

    async fn upsert(&mut self) -> Result<u64, JobError> {
        let plan = self.plan;
        let op = RemoteOperation::UpsertMirror {
            project_id: plan.scope.project_id,
            direction: plan.scope.direction,
            mirror_id: plan.recorded_mirror_id(),
            peer_url: plan.peer_url(),
            settings: plan.settings.clone(),
        };
        let payload = self.call(plan.home(), &op).await?;
        let id = match plan.scope.direction {
            Direction::Push => payload
                .get("id")
                .and_then(Value::as_u64)
                .or(plan.recorded_mirror_id()),
            Direction::Pull => Some(plan.scope.project_id.0),
        };
        id.ok_or_else(|| {
            JobError::new(
                ErrorCategory::Permanent,
                format!("upsert_mirror returned no mirror id for {}", plan.mirror.project_path),
            )
        })
    }

    /// Page through issues from `page`. On failure returns the page to resume at.
    async fn sync_issues(&mut self, mut page: u32) -> Result<(), (u32, JobError)> {
        let plan = self.plan;
        let progress = self.progress;
        loop {
            let op = RemoteOperation::SyncIssues {
                project_id: plan.scope.project_id,
                source_url: plan.source_project_url(),
                page,
                per_page: ISSUES_PER_PAGE,
            };
            let payload = self.call(&plan.target, &op).await.map_err(|e| (page, e))?;
            let next = payload
                .get("next_page")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > page);
            match next {
                Some(next) => {
                    page = next;
                    progress.save_cursor(Some(page));
                }
                None => {
                    progress.save_cursor(None);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use mirrorsync_core::{
        CheckpointStatus, CredentialHandle, EngineConfig, LimiterConfig, MirrorOptions, ProjectId,
        TargetId,
    };
    use serde_json::json;

    use crate::breaker::BreakerRegistry;
    use crate::remote::OperationResult;
    use crate::store::MemoryStateStore;

    #[derive(Default)]
    struct Recording {
        script: Mutex<VecDeque<(&'static str, OperationResult)>>,
        seen: Mutex<Vec<(String, RemoteOperation)>>,
    }

    impl Recording {
        fn scripted(script: Vec<(&'static str, OperationResult)>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::default(),
            }
        }

        fn ops(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|(on, op)| format!("{on}:{op}"))
                .collect()
        }
    }

    #[async_trait]
    impl RemoteClient for Recording {
        async fn invoke(&self, target: &RemoteTarget, op: &RemoteOperation) -> OperationResult {
            self.seen.lock().unwrap().push((target.id.0.clone(), op.clone()));
            let mut script = self.script.lock().unwrap();
            match script.front() {
                Some((name, _)) if *name == op.name() => script.pop_front().unwrap().1,
                _ => OperationResult::Ok(json!({ "id": 40 })),
            }
        }
    }

    fn limiter() -> RateLimiter {
        let config = Arc::new(EngineConfig {
            limiter: LimiterConfig {
                min_interval_ms: 0,
                max_retries: 0,
                ..LimiterConfig::default()
            },
            ..EngineConfig::default()
        });
        RateLimiter::new(config.clone(), Arc::new(BreakerRegistry::new(config)))
    }

    fn remote(id: &str) -> RemoteTarget {
        RemoteTarget {
            id: TargetId::from(id),
            base_url: format!("https://{id}.example.com/"),
            credential: CredentialHandle("TOKEN".into()),
            label: None,
        }
    }

    fn plan_for(direction: Direction, settings: EffectiveSettings, checkpoint: Option<Checkpoint>) -> RunPlan {
        RunPlan {
            job_id: JobId::from("job-1"),
            scope: ScopeKey::new("a-to-b", direction, 7),
            mirror: MirrorConfig {
                project_id: ProjectId(7),
                project_path: "team/app".into(),
                overrides: MirrorOptions::default(),
            },
            source: remote("a"),
            target: remote("b"),
            settings,
            checkpoint,
        }
    }

    fn prior(cursor: Option<u32>, mirror_id: Option<u64>) -> Checkpoint {
        Checkpoint {
            scope: ScopeKey::new("a-to-b", Direction::Push, 7),
            cursor,
            last_sync_status: CheckpointStatus::Partial,
            last_sync_at: Utc::now(),
            last_progress_at: None,
            settings_digest: None,
            last_error: None,
            consecutive_failures: 1,
            mirror_id,
        }
    }

    fn progress(store: &Arc<MemoryStateStore>) -> Progress {
        Progress::new(store.clone(), ScopeKey::new("a-to-b", Direction::Push, 7))
    }

    #[tokio::test]
    async fn push_run_upserts_on_source_and_triggers() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::default();
        let plan = plan_for(Direction::Push, EffectiveSettings::default(), None);

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.mirror_id, Some(40));
        assert_eq!(client.ops(), ["a:upsert_mirror", "a:trigger_update"]);
        assert_eq!(plan.peer_url(), "https://b.example.com/team/app.git");
    }

    #[tokio::test]
    async fn pull_run_configures_target_project() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::default();
        let plan = plan_for(Direction::Pull, EffectiveSettings::default(), None);

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;

        assert_eq!(outcome.mirror_id, Some(7));
        assert_eq!(client.ops(), ["b:upsert_mirror", "b:trigger_update"]);
    }

    #[tokio::test]
    async fn failed_upsert_fails_run_with_safe_message() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::scripted(vec![(
            "upsert_mirror",
            OperationResult::PermanentError("HTTP 403 secret-token-echo".into()),
        )]);
        let plan = plan_for(Direction::Push, EffectiveSettings::default(), None);

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        let error = outcome.error.expect("error");
        assert_eq!(error.category, ErrorCategory::Permanent);
        assert_eq!(error.message, "upsert_mirror failed for team/app");
        assert_eq!(client.ops(), ["a:upsert_mirror"]);
    }

    #[tokio::test]
    async fn failed_trigger_makes_run_partial() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::scripted(vec![
            ("upsert_mirror", OperationResult::Ok(json!({ "id": 5 }))),
            ("trigger_update", OperationResult::TransientError("HTTP 502".into())),
        ]);
        let plan = plan_for(Direction::Push, EffectiveSettings::default(), None);

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;

        assert_eq!(outcome.status, JobStatus::Partial);
        assert_eq!(outcome.mirror_id, Some(5));
        assert_eq!(outcome.error.map(|e| e.category), Some(ErrorCategory::Transient));
    }

    #[tokio::test]
    async fn disabled_mirror_is_deleted_when_recorded() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::default();
        let disabled = EffectiveSettings {
            enabled: false,
            ..EffectiveSettings::default()
        };
        let plan = plan_for(Direction::Push, disabled.clone(), Some(prior(None, Some(12))));

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.mirror_id, None);
        assert_eq!(client.ops(), ["a:delete_mirror"]);

        let never_created = plan_for(Direction::Push, disabled, None);
        let client = Recording::default();
        let outcome = execute(&never_created, &limiter(), &client, &progress(&store)).await;
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert!(client.ops().is_empty());
    }

    #[tokio::test]
    async fn issue_paging_resumes_from_cursor_and_persists_progress() {
        let store = Arc::new(MemoryStateStore::default());
        store.save_checkpoint(&prior(Some(3), Some(12))).unwrap();
        let client = Recording::scripted(vec![
            ("upsert_mirror", OperationResult::Ok(json!({ "id": 12 }))),
            ("sync_issues", OperationResult::Ok(json!({ "next_page": 4 }))),
            ("sync_issues", OperationResult::TransientError("HTTP 503".into())),
        ]);
        let settings = EffectiveSettings {
            mirror_issues: true,
            trigger_update: false,
            ..EffectiveSettings::default()
        };
        let plan = plan_for(Direction::Push, settings, Some(prior(Some(3), Some(12))));

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;

        assert_eq!(outcome.status, JobStatus::Partial);
        assert_eq!(outcome.cursor, Some(4));
        let pages: Vec<u32> = client
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, op)| match op {
                RemoteOperation::SyncIssues { page, .. } => Some(*page),
                _ => None,
            })
            .collect();
        assert_eq!(pages, [3, 4]);
        let saved = store.load_checkpoint(&plan.scope).unwrap().expect("checkpoint");
        assert_eq!(saved.cursor, Some(4));
        assert_eq!(saved.last_sync_status, CheckpointStatus::Partial, "status untouched by progress");
    }

    #[tokio::test]
    async fn completed_paging_resets_cursor() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::scripted(vec![
            ("upsert_mirror", OperationResult::Ok(json!({ "id": 12 }))),
            ("sync_issues", OperationResult::Ok(json!({ "next_page": 2 }))),
            ("sync_issues", OperationResult::Ok(Value::Null)),
        ]);
        let settings = EffectiveSettings {
            mirror_issues: true,
            trigger_update: false,
            ..EffectiveSettings::default()
        };
        let plan = plan_for(Direction::Push, settings, None);

        let outcome = execute(&plan, &limiter(), &client, &progress(&store)).await;
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.cursor, None);
    }

    #[test]
    fn abandoned_progress_discards_writes() {
        let store = Arc::new(MemoryStateStore::default());
        store.save_checkpoint(&prior(Some(1), None)).unwrap();
        let progress = progress(&store);
        progress.abandon();
        assert!(progress.is_abandoned());
        progress.save_cursor(Some(9));
        let saved = store
            .load_checkpoint(&ScopeKey::new("a-to-b", Direction::Push, 7))
            .unwrap()
            .unwrap();
        assert_eq!(saved.cursor, Some(1));
    }

    #[tokio::test]
    async fn abandoned_run_issues_no_further_calls() {
        let store = Arc::new(MemoryStateStore::default());
        let client = Recording::default();
        let plan = plan_for(Direction::Push, EffectiveSettings::default(), None);
        let progress = progress(&store);
        progress.abandon();

        let outcome = execute(&plan, &limiter(), &client, &progress).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error.map(|e| e.category), Some(ErrorCategory::Timeout));
        assert!(client.ops().is_empty());
    }
}

//! The control loop.
//!
//! Each run has two phases:
//!
//! 1. **Admit** (synchronous): claim the scope in the [`TaskRegistry`], check
//!    for a reverse-direction conflict, and record the job as running. The
//!    conflict check and the insertion into the active set happen under one
//!    lock, so two reverse scopes admitted concurrently cannot both pass.
//! 2. **Execute** (async): run the operation sequence in its own task under
//!    the run timeout, then finalize: write the terminal job and checkpoint,
//!    and release the registry entry.
//!
//! Ownership of the scope (the [`TaskGuard`]) travels with the run, so the
//! release happens on every exit path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use mirrorsync_core::settings::resolve_for;
use mirrorsync_core::{
    Checkpoint, CheckpointStatus, ConflictRecord, EngineConfig, ErrorCategory, JobError, JobId,
    JobStatus, PairId, ProjectId, ScopeKey, SyncJob,
};

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::conflict::{order_due, ConflictDetector, ConflictLog};
use crate::error::EngineError;
use crate::executor::{self, Progress, RunOutcome, RunPlan};
use crate::limiter::RateLimiter;
use crate::remote::RemoteClient;
use crate::source::ConfigSource;
use crate::staleness::{self, DueSignal};
use crate::store::StateStore;
use crate::tasks::{TaskGuard, TaskRegistry};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Another run of the same scope is in flight.
    AlreadyRunning,
    /// A reverse-direction run blocks this one.
    Conflict { blocking: ScopeKey, job: JobId },
}

/// How one triggered run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunReport {
    /// The run executed; the job is terminal.
    Completed(SyncJob),
    Skipped { scope: ScopeKey, reason: SkipReason },
    /// Not started because of a conflict.
    Held(ConflictRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub scope: ScopeKey,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub scope: ScopeKey,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Aggregated outcome of a batch or tick. One item's failure never aborts
/// its siblings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub partial: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failed and partial items, with a stable category.
    pub per_item_errors: Vec<ItemError>,
    pub skipped_items: Vec<SkippedItem>,
    pub duration_ms: u64,
}

impl BatchResult {
    fn record(&mut self, report: RunReport) {
        match report {
            RunReport::Completed(job) => {
                match job.status {
                    JobStatus::Succeeded => self.succeeded += 1,
                    JobStatus::Partial => self.partial += 1,
                    _ => self.failed += 1,
                }
                if let Some(error) = job.error {
                    self.per_item_errors.push(ItemError {
                        scope: job.scope,
                        category: error.category,
                        message: error.message,
                    });
                }
            }
            RunReport::Skipped { scope, reason } => {
                self.skipped += 1;
                self.skipped_items.push(SkippedItem { scope, reason });
            }
            RunReport::Held(record) => {
                self.skipped += 1;
                self.skipped_items.push(SkippedItem {
                    scope: record.held,
                    reason: SkipReason::Conflict {
                        blocking: record.blocking,
                        job: record.blocking_job,
                    },
                });
            }
        }
    }

    fn record_error(&mut self, scope: ScopeKey, error: &EngineError) {
        tracing::error!(scope = %scope, error = %error, "run could not be started");
        self.failed += 1;
        self.per_item_errors.push(ItemError {
            scope,
            category: ErrorCategory::Internal,
            message: "run could not be started".to_string(),
        });
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.partial + self.skipped + self.failed
    }
}

/// Checkpoint plus running flag for one configured scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeStatus {
    pub scope: ScopeKey,
    pub running: bool,
    pub due: DueSignal,
    pub checkpoint: Option<Checkpoint>,
}

/// Handle to a triggered run.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Option<JobId>,
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(RunReport),
    Running(JoinHandle<SyncJob>),
}

impl JobHandle {
    /// The job id when the run was admitted.
    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub async fn wait(self) -> Result<RunReport, EngineError> {
        match self.state {
            HandleState::Ready(report) => Ok(report),
            HandleState::Running(handle) => handle
                .await
                .map(RunReport::Completed)
                .map_err(|e| EngineError::Join(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones share one registry, breaker set and ledger.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<EngineConfig>,
    source: Arc<dyn ConfigSource>,
    store: Arc<dyn StateStore>,
    client: Arc<dyn RemoteClient>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    tasks: Arc<TaskRegistry>,
    detector: ConflictDetector,
    conflicts: ConflictLog,
    ledger: Mutex<Ledger>,
    seq: AtomicU64,
}

/// In-process jobs: running now, and recently finished.
#[derive(Default)]
struct Ledger {
    active: HashMap<ScopeKey, SyncJob>,
    finished: VecDeque<SyncJob>,
}

struct Admitted {
    plan: RunPlan,
    job: SyncJob,
    guard: TaskGuard,
}

enum Admission {
    Run(Box<Admitted>),
    Report(RunReport),
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ConfigSource>,
        store: Arc<dyn StateStore>,
        client: Arc<dyn RemoteClient>,
    ) -> Self {
        let config = Arc::new(config);
        let breakers = Arc::new(BreakerRegistry::new(config.clone()));
        let limiter = Arc::new(RateLimiter::new(config.clone(), breakers.clone()));
        Self {
            inner: Arc::new(Inner {
                detector: ConflictDetector::new(&config.conflict, config.run_timeout()),
                conflicts: ConflictLog::new(config.conflict.history),
                config,
                source,
                store,
                client,
                limiter,
                breakers,
                tasks: Arc::new(TaskRegistry::new()),
                ledger: Mutex::new(Ledger::default()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Finalize jobs left `pending`/`running` by a previous process as
    /// failed/interrupted. Returns how many were repaired.
    pub fn recover(&self) -> Result<usize, EngineError> {
        let inner = &self.inner;
        let now = Utc::now();
        let dangling: Vec<SyncJob> = inner
            .store
            .load_jobs()?
            .into_iter()
            .filter(|job| !job.status.is_terminal() && !inner.tasks.is_running(&job.scope))
            .collect();

        for mut job in dangling.iter().cloned() {
            let error = JobError::new(
                ErrorCategory::Interrupted,
                "run was interrupted before it finished",
            );
            job.finish(JobStatus::Failed, Some(error.clone()), now);
            inner.store.save_job(&job)?;

            let checkpoint = match inner.store.load_checkpoint(&job.scope)? {
                Some(mut cp) => {
                    cp.last_sync_status = CheckpointStatus::Failed;
                    cp.last_sync_at = now;
                    cp.last_error = Some(error);
                    cp.consecutive_failures += 1;
                    cp
                }
                None => Checkpoint {
                    scope: job.scope.clone(),
                    cursor: None,
                    last_sync_status: CheckpointStatus::Failed,
                    last_sync_at: now,
                    last_progress_at: None,
                    settings_digest: None,
                    last_error: Some(error),
                    consecutive_failures: 1,
                    mirror_id: None,
                },
            };
            inner.store.save_checkpoint(&checkpoint)?;
            tracing::warn!(job = %job.id, scope = %job.scope, "recovered interrupted job");
        }
        Ok(dangling.len())
    }

    /// Run every due scope in parallel and wait for all of them.
    pub async fn tick(&self) -> Result<BatchResult, EngineError> {
        let started = Instant::now();
        let pairs = self.inner.source.pairs()?;
        let mut due = staleness::discover(
            &pairs,
            self.inner.store.as_ref(),
            std::time::Duration::from_secs(self.inner.config.retry_delay_secs),
            Utc::now(),
        )?;
        order_due(&mut due, self.inner.config.conflict.tie_break, |d| &d.scope);
        tracing::debug!(due = due.len(), "tick");

        let mut result = BatchResult::default();
        let mut running = Vec::new();
        for item in due {
            match self.inner.admit(&item.scope) {
                Ok(Admission::Run(admitted)) => {
                    let scope = admitted.plan.scope.clone();
                    running.push((scope, tokio::spawn(self.inner.clone().run(*admitted))));
                }
                Ok(Admission::Report(report)) => result.record(report),
                Err(e) => result.record_error(item.scope, &e),
            }
        }
        for (scope, handle) in running {
            match handle.await {
                Ok(job) => result.record(RunReport::Completed(job)),
                Err(e) => result.record_error(scope, &EngineError::Join(e.to_string())),
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        if result.total() > 0 {
            tracing::info!(
                succeeded = result.succeeded,
                partial = result.partial,
                skipped = result.skipped,
                failed = result.failed,
                duration_ms = result.duration_ms,
                "tick finished",
            );
        }
        Ok(result)
    }

    /// Start one run of `scope` in the background.
    ///
    /// Contention and conflicts are not errors: the handle resolves to a
    /// `Skipped` or `Held` report.
    pub fn trigger_sync(&self, scope: &ScopeKey) -> Result<JobHandle, EngineError> {
        match self.inner.admit(scope)? {
            Admission::Run(admitted) => Ok(JobHandle {
                job_id: Some(admitted.job.id.clone()),
                state: HandleState::Running(tokio::spawn(self.inner.clone().run(*admitted))),
            }),
            Admission::Report(report) => Ok(JobHandle {
                job_id: None,
                state: HandleState::Ready(report),
            }),
        }
    }

    /// Sync every mirror of `pair_id` one after another, pausing between
    /// items.
    pub async fn trigger_batch(&self, pair_id: &PairId) -> Result<BatchResult, EngineError> {
        let started = Instant::now();
        let pair = self.inner.source.pair(pair_id)?;
        let delay = self.inner.config.batch_item_delay();
        let mut result = BatchResult::default();

        for (index, mirror) in pair.mirrors.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let scope = pair.scope(mirror.project_id);
            match self.inner.admit(&scope) {
                Ok(Admission::Run(admitted)) => {
                    let job = self.inner.clone().run(*admitted).await;
                    result.record(RunReport::Completed(job));
                }
                Ok(Admission::Report(report)) => result.record(report),
                Err(e) => result.record_error(scope, &e),
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            pair = %pair_id,
            succeeded = result.succeeded,
            partial = result.partial,
            skipped = result.skipped,
            failed = result.failed,
            duration_ms = result.duration_ms,
            "batch finished",
        );
        Ok(result)
    }

    /// The scope of `project_id` within `pair_id`, in the pair's direction.
    pub fn scope_for(&self, pair_id: &PairId, project_id: ProjectId) -> Result<ScopeKey, EngineError> {
        let pair = self.inner.source.pair(pair_id)?;
        let scope = pair.scope(project_id);
        match pair.mirror(project_id) {
            Some(_) => Ok(scope),
            None => Err(EngineError::UnknownScope(scope)),
        }
    }

    /// Every configured scope with its checkpoint and running flag.
    pub fn status(&self) -> Result<Vec<ScopeStatus>, EngineError> {
        let pairs = self.inner.source.pairs()?;
        let assessed = staleness::assess(
            &pairs,
            self.inner.store.as_ref(),
            std::time::Duration::from_secs(self.inner.config.retry_delay_secs),
            Utc::now(),
        )?;
        Ok(assessed
            .into_iter()
            .map(|a| ScopeStatus {
                running: self.inner.tasks.is_running(&a.scope),
                scope: a.scope,
                due: a.signal,
                checkpoint: a.checkpoint,
            })
            .collect())
    }

    pub fn checkpoint(&self, scope: &ScopeKey) -> Result<Option<Checkpoint>, EngineError> {
        self.inner.store.load_checkpoint(scope)
    }

    pub fn is_running(&self, scope: &ScopeKey) -> bool {
        self.inner.tasks.is_running(scope)
    }

    pub fn running(&self) -> Vec<ScopeKey> {
        self.inner.tasks.running()
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshots()
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictRecord> {
        self.inner.conflicts.subscribe()
    }

    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.conflicts.recent()
    }
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_job_id(&self) -> JobId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        JobId(format!("{}-{seq}", Utc::now().format("%Y%m%dT%H%M%S%3f")))
    }

    fn admit(&self, scope: &ScopeKey) -> Result<Admission, EngineError> {
        let pair = self.source.pair(&scope.pair_id)?;
        let mirror = pair
            .mirror(scope.project_id)
            .filter(|_| pair.direction == scope.direction)
            .cloned()
            .ok_or_else(|| EngineError::UnknownScope(scope.clone()))?;
        let source = self.source.target(&pair, &pair.source)?;
        let target = self.source.target(&pair, &pair.target)?;

        let Some(guard) = self.tasks.acquire(scope) else {
            tracing::debug!(scope = %scope, "already running, skipped");
            return Ok(Admission::Report(RunReport::Skipped {
                scope: scope.clone(),
                reason: SkipReason::AlreadyRunning,
            }));
        };

        let checkpoint = self.store.load_checkpoint(scope)?;
        let journal = self.store.load_jobs()?;

        let now = Utc::now();
        let job = SyncJob {
            id: self.next_job_id(),
            scope: scope.clone(),
            source_instance_id: pair.source.clone(),
            target_instance_id: pair.target.clone(),
            status: JobStatus::Pending,
            started_at: now,
            finished_at: None,
            error: None,
            retry_count: 0,
        };

        {
            let mut ledger = self.ledger();
            let candidates = ledger
                .active
                .values()
                .chain(ledger.finished.iter())
                .chain(journal.iter());
            if let Some(record) =
                self.detector
                    .check(scope, &pair.source, &pair.target, candidates, now)
            {
                drop(ledger);
                self.conflicts.publish(record.clone());
                return Ok(Admission::Report(RunReport::Held(record)));
            }
            ledger.active.insert(scope.clone(), job.clone());
        }

        if let Err(e) = self.store.save_job(&job) {
            self.ledger().active.remove(scope);
            return Err(e);
        }

        tracing::info!(job = %job.id, scope = %scope, "run started");
        let settings = resolve_for(&pair, &mirror);
        Ok(Admission::Run(Box::new(Admitted {
            plan: RunPlan {
                job_id: job.id.clone(),
                scope: scope.clone(),
                mirror,
                source,
                target,
                settings,
                checkpoint,
            },
            job,
            guard,
        })))
    }

    async fn run(self: Arc<Self>, admitted: Admitted) -> SyncJob {
        let Admitted { plan, mut job, guard } = admitted;
        let progress = Progress::new(self.store.clone(), plan.scope.clone());
        let timeout = self.config.run_timeout();

        job.status = JobStatus::Running;
        self.ledger().active.insert(plan.scope.clone(), job.clone());
        if let Err(e) = self.store.save_job(&job) {
            tracing::warn!(job = %job.id, error = %e, "failed to journal running job");
        }

        let execution = tokio::spawn({
            let plan = plan.clone();
            let limiter = self.limiter.clone();
            let client = self.client.clone();
            let progress = progress.clone();
            async move { executor::execute(&plan, &limiter, client.as_ref(), &progress).await }
        });
        let abort = execution.abort_handle();

        let prior_cursor = plan.checkpoint.as_ref().and_then(|cp| cp.cursor);
        let prior_mirror = plan.checkpoint.as_ref().and_then(|cp| cp.mirror_id);
        let outcome = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                tracing::error!(job = %job.id, scope = %plan.scope, error = %join_error, "run task failed");
                RunOutcome {
                    status: JobStatus::Failed,
                    error: Some(JobError::new(
                        ErrorCategory::Internal,
                        format!("run aborted for {}", plan.mirror.project_path),
                    )),
                    retries: 0,
                    mirror_id: prior_mirror,
                    cursor: prior_cursor,
                }
            }
            Err(_) => {
                // Cancel at the pending call; nothing after it may run once
                // the scope is released.
                progress.abandon();
                abort.abort();
                tracing::warn!(job = %job.id, scope = %plan.scope, timeout_secs = timeout.as_secs(), "run timed out, abandoned");
                RunOutcome {
                    status: JobStatus::Failed,
                    error: Some(JobError::new(
                        ErrorCategory::Timeout,
                        format!(
                            "run exceeded {}s for {}",
                            timeout.as_secs(),
                            plan.mirror.project_path
                        ),
                    )),
                    retries: 0,
                    mirror_id: prior_mirror,
                    cursor: prior_cursor,
                }
            }
        };

        let job = self.finalize(&plan, job, outcome);
        drop(guard);
        job
    }

    /// Write the terminal job and checkpoint. Store failures are logged, never
    /// propagated: the registry entry must still be released.
    fn finalize(&self, plan: &RunPlan, mut job: SyncJob, outcome: RunOutcome) -> SyncJob {
        let now = Utc::now();
        let RunOutcome {
            status,
            error,
            retries,
            mirror_id,
            cursor,
        } = outcome;
        let status = if status.is_terminal() {
            status
        } else {
            JobStatus::Failed
        };
        job.retry_count = retries;
        job.finish(status, error.clone(), now);

        let prior = plan.checkpoint.as_ref();
        let checkpoint = Checkpoint {
            scope: plan.scope.clone(),
            cursor,
            last_sync_status: status.terminal().unwrap_or(CheckpointStatus::Failed),
            last_sync_at: now,
            last_progress_at: if status == JobStatus::Failed {
                prior.and_then(|cp| cp.last_progress_at)
            } else {
                Some(now)
            },
            settings_digest: Some(staleness::settings_digest(&plan.settings)),
            last_error: error,
            consecutive_failures: if status == JobStatus::Succeeded {
                0
            } else {
                prior.map_or(0, |cp| cp.consecutive_failures) + 1
            },
            mirror_id,
        };

        if let Err(e) = self.store.save_checkpoint(&checkpoint) {
            tracing::error!(scope = %plan.scope, error = %e, "failed to write checkpoint");
        }
        if let Err(e) = self.store.save_job(&job) {
            tracing::error!(job = %job.id, error = %e, "failed to write job record");
        }

        {
            let mut ledger = self.ledger();
            ledger.active.remove(&plan.scope);
            ledger.finished.push_back(job.clone());
            while ledger.finished.len() > self.config.job_history.max(1) {
                ledger.finished.pop_front();
            }
        }

        match &job.error {
            Some(error) => tracing::warn!(
                job = %job.id,
                scope = %job.scope,
                status = %job.status,
                category = %error.category,
                retries = job.retry_count,
                "run finished",
            ),
            None => tracing::info!(job = %job.id, scope = %job.scope, status = %job.status, "run finished"),
        }
        job
    }
}

//! Persistence for job records and checkpoints.
//!
//! # Storage layout
//!
//! ```text
//! ~/.mirrorsync/state/
//!   jobs.json                (job journal, newest last)
//!   checkpoints/<pair>.json  (one array of checkpoints per pair)
//! ```
//!
//! Writes use the same atomic `.tmp` + rename pattern as the registry, and a
//! store-wide lock serializes each read-modify-write so concurrent runs on
//! different scopes of one pair never lose each other's updates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use mirrorsync_core::registry;
use mirrorsync_core::{Checkpoint, PairId, ScopeKey, SyncJob};

use crate::error::{io_err, EngineError};

/// Load/save of [`SyncJob`] and [`Checkpoint`] records.
pub trait StateStore: Send + Sync {
    fn load_checkpoints(&self, pair: &PairId) -> Result<Vec<Checkpoint>, EngineError>;

    fn load_checkpoint(&self, scope: &ScopeKey) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self
            .load_checkpoints(&scope.pair_id)?
            .into_iter()
            .find(|cp| &cp.scope == scope))
    }

    /// Insert or replace the checkpoint for `checkpoint.scope`.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;

    fn remove_checkpoints(&self, pair: &PairId) -> Result<(), EngineError>;

    /// Drop the checkpoint of one scope. Missing scopes are not an error.
    fn remove_checkpoint(&self, scope: &ScopeKey) -> Result<(), EngineError>;

    /// Journaled jobs, oldest first.
    fn load_jobs(&self) -> Result<Vec<SyncJob>, EngineError>;

    /// Insert or replace the job with `job.id`, pruning old terminal jobs.
    fn save_job(&self, job: &SyncJob) -> Result<(), EngineError>;
}

/// Upsert `job` into `jobs` and drop the oldest terminal entries beyond
/// `history`. Non-terminal jobs are never pruned.
fn merge_job(jobs: &mut Vec<SyncJob>, job: &SyncJob, history: usize) {
    match jobs.iter_mut().find(|j| j.id == job.id) {
        Some(existing) => *existing = job.clone(),
        None => jobs.push(job.clone()),
    }
    let mut excess = jobs.len().saturating_sub(history);
    if excess > 0 {
        jobs.retain(|j| {
            if excess > 0 && j.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

fn merge_checkpoint(checkpoints: &mut Vec<Checkpoint>, checkpoint: &Checkpoint) {
    match checkpoints.iter_mut().find(|cp| cp.scope == checkpoint.scope) {
        Some(existing) => *existing = checkpoint.clone(),
        None => checkpoints.push(checkpoint.clone()),
    }
    checkpoints.sort_by(|a, b| a.scope.cmp(&b.scope));
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    job_history: usize,
    lock: Mutex<()>,
}

impl FileStateStore {
    /// Store rooted at `<home>/.mirrorsync/state`.
    pub fn at(home: &Path, job_history: usize) -> Self {
        Self {
            dir: state_dir_at(home),
            job_history,
            lock: Mutex::new(()),
        }
    }

    pub fn open(job_history: usize) -> Result<Self, EngineError> {
        Ok(Self::at(&registry::home()?, job_history))
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.dir.join("jobs.json")
    }

    pub fn checkpoints_path(&self, pair: &PairId) -> PathBuf {
        self.dir.join("checkpoints").join(format!("{pair}.json"))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `<home>/.mirrorsync/state`
pub fn state_dir_at(home: &Path) -> PathBuf {
    registry::root_at(home).join("state")
}

impl StateStore for FileStateStore {
    fn load_checkpoints(&self, pair: &PairId) -> Result<Vec<Checkpoint>, EngineError> {
        let _guard = self.guard();
        read_json_or_default(&self.checkpoints_path(pair))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let _guard = self.guard();
        let path = self.checkpoints_path(&checkpoint.scope.pair_id);
        let mut checkpoints: Vec<Checkpoint> = read_json_or_default(&path)?;
        merge_checkpoint(&mut checkpoints, checkpoint);
        write_json_atomic(&path, &checkpoints)
    }

    fn remove_checkpoints(&self, pair: &PairId) -> Result<(), EngineError> {
        let _guard = self.guard();
        let path = self.checkpoints_path(pair);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path, e)),
        }
    }

    fn remove_checkpoint(&self, scope: &ScopeKey) -> Result<(), EngineError> {
        let _guard = self.guard();
        let path = self.checkpoints_path(&scope.pair_id);
        if !path.exists() {
            return Ok(());
        }
        let mut checkpoints: Vec<Checkpoint> = read_json_or_default(&path)?;
        let before = checkpoints.len();
        checkpoints.retain(|cp| &cp.scope != scope);
        if checkpoints.len() == before {
            return Ok(());
        }
        write_json_atomic(&path, &checkpoints)
    }

    fn load_jobs(&self) -> Result<Vec<SyncJob>, EngineError> {
        let _guard = self.guard();
        read_json_or_default(&self.jobs_path())
    }

    fn save_job(&self, job: &SyncJob) -> Result<(), EngineError> {
        let _guard = self.guard();
        let path = self.jobs_path();
        let mut jobs: Vec<SyncJob> = read_json_or_default(&path)?;
        merge_job(&mut jobs, job, self.job_history);
        write_json_atomic(&path, &jobs)
    }
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, EngineError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid state path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Memory store
// ---------------------------------------------------------------------------

/// Process-local store, for tests and one-shot CLI runs.
#[derive(Debug)]
pub struct MemoryStateStore {
    job_history: usize,
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    checkpoints: BTreeMap<PairId, Vec<Checkpoint>>,
    jobs: Vec<SyncJob>,
}

impl MemoryStateStore {
    pub fn new(job_history: usize) -> Self {
        Self {
            job_history,
            inner: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(500)
    }
}

impl StateStore for MemoryStateStore {
    fn load_checkpoints(&self, pair: &PairId) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.lock().checkpoints.get(pair).cloned().unwrap_or_default())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let mut state = self.lock();
        let entry = state
            .checkpoints
            .entry(checkpoint.scope.pair_id.clone())
            .or_default();
        merge_checkpoint(entry, checkpoint);
        Ok(())
    }

    fn remove_checkpoints(&self, pair: &PairId) -> Result<(), EngineError> {
        self.lock().checkpoints.remove(pair);
        Ok(())
    }

    fn remove_checkpoint(&self, scope: &ScopeKey) -> Result<(), EngineError> {
        if let Some(checkpoints) = self.lock().checkpoints.get_mut(&scope.pair_id) {
            checkpoints.retain(|cp| &cp.scope != scope);
        }
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<SyncJob>, EngineError> {
        Ok(self.lock().jobs.clone())
    }

    fn save_job(&self, job: &SyncJob) -> Result<(), EngineError> {
        let history = self.job_history;
        merge_job(&mut self.lock().jobs, job, history);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mirrorsync_core::{CheckpointStatus, Direction, JobId, JobStatus, TargetId};
    use tempfile::TempDir;

    fn job(id: &str, status: JobStatus) -> SyncJob {
        SyncJob {
            id: JobId::from(id),
            scope: ScopeKey::new("a-to-b", Direction::Push, 1),
            source_instance_id: TargetId::from("a"),
            target_instance_id: TargetId::from("b"),
            status,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            retry_count: 0,
        }
    }

    fn checkpoint(project: u64, status: CheckpointStatus) -> Checkpoint {
        Checkpoint {
            scope: ScopeKey::new("a-to-b", Direction::Push, project),
            cursor: None,
            last_sync_status: status,
            last_sync_at: Utc::now(),
            last_progress_at: None,
            settings_digest: None,
            last_error: None,
            consecutive_failures: 0,
            mirror_id: None,
        }
    }

    #[test]
    fn missing_files_load_empty() {
        let home = TempDir::new().unwrap();
        let store = FileStateStore::at(home.path(), 10);
        assert!(store.load_jobs().unwrap().is_empty());
        assert!(store.load_checkpoints(&PairId::from("a-to-b")).unwrap().is_empty());
        assert!(store
            .load_checkpoint(&ScopeKey::new("a-to-b", Direction::Push, 1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn checkpoints_upsert_by_scope() {
        let home = TempDir::new().unwrap();
        let store = FileStateStore::at(home.path(), 10);
        store.save_checkpoint(&checkpoint(2, CheckpointStatus::Failed)).unwrap();
        store.save_checkpoint(&checkpoint(1, CheckpointStatus::Succeeded)).unwrap();
        store.save_checkpoint(&checkpoint(2, CheckpointStatus::Partial)).unwrap();

        let all = store.load_checkpoints(&PairId::from("a-to-b")).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].scope.project_id.0, 1);
        assert_eq!(all[1].last_sync_status, CheckpointStatus::Partial);
        assert!(!store
            .checkpoints_path(&PairId::from("a-to-b"))
            .with_extension("json.tmp")
            .exists());
    }

    #[test]
    fn remove_checkpoints_is_idempotent() {
        let home = TempDir::new().unwrap();
        let store = FileStateStore::at(home.path(), 10);
        store.save_checkpoint(&checkpoint(1, CheckpointStatus::Succeeded)).unwrap();
        store.remove_checkpoints(&PairId::from("a-to-b")).unwrap();
        store.remove_checkpoints(&PairId::from("a-to-b")).unwrap();
        assert!(store.load_checkpoints(&PairId::from("a-to-b")).unwrap().is_empty());
    }

    #[test]
    fn remove_checkpoint_drops_only_its_scope() {
        let home = TempDir::new().unwrap();
        let file = FileStateStore::at(home.path(), 10);
        let memory = MemoryStateStore::default();
        let stores: [&dyn StateStore; 2] = [&file, &memory];
        for store in stores {
            store.save_checkpoint(&checkpoint(1, CheckpointStatus::Succeeded)).unwrap();
            store.save_checkpoint(&checkpoint(2, CheckpointStatus::Failed)).unwrap();

            store
                .remove_checkpoint(&ScopeKey::new("a-to-b", Direction::Push, 2))
                .unwrap();
            store
                .remove_checkpoint(&ScopeKey::new("a-to-b", Direction::Push, 9))
                .unwrap();
            store
                .remove_checkpoint(&ScopeKey::new("x-to-y", Direction::Push, 1))
                .unwrap();

            let left = store.load_checkpoints(&PairId::from("a-to-b")).unwrap();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].scope.project_id.0, 1);
        }
    }

    #[test]
    fn job_journal_prunes_oldest_terminal_entries() {
        let home = TempDir::new().unwrap();
        let store = FileStateStore::at(home.path(), 2);
        store.save_job(&job("running", JobStatus::Running)).unwrap();
        store.save_job(&job("j1", JobStatus::Succeeded)).unwrap();
        store.save_job(&job("j2", JobStatus::Failed)).unwrap();
        store.save_job(&job("j3", JobStatus::Succeeded)).unwrap();

        let ids: Vec<String> = store.load_jobs().unwrap().into_iter().map(|j| j.id.0).collect();
        assert_eq!(ids, ["running", "j3"]);
    }

    #[test]
    fn save_job_replaces_by_id() {
        let store = MemoryStateStore::new(10);
        store.save_job(&job("j1", JobStatus::Running)).unwrap();
        store.save_job(&job("j1", JobStatus::Succeeded)).unwrap();
        let jobs = store.load_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Succeeded);
    }

    #[test]
    fn corrupt_journal_is_an_error() {
        let home = TempDir::new().unwrap();
        let store = FileStateStore::at(home.path(), 10);
        std::fs::create_dir_all(store.jobs_path().parent().unwrap()).unwrap();
        std::fs::write(store.jobs_path(), "{ not json").unwrap();
        assert!(matches!(store.load_jobs(), Err(EngineError::Json(_))));
    }
}

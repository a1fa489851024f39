//! In-memory set of scopes that currently have a run in flight.
//!
//! Membership in this set is the only "running" flag in the system; persisted
//! checkpoints hold terminal statuses only.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use mirrorsync_core::ScopeKey;

#[derive(Debug, Default)]
pub struct TaskRegistry {
    running: Mutex<HashSet<ScopeKey>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check-and-insert. Exactly one of any set of concurrent
    /// callers for the same key gets `true`.
    pub fn try_acquire(&self, key: &ScopeKey) -> bool {
        self.lock().insert(key.clone())
    }

    pub fn release(&self, key: &ScopeKey) {
        self.lock().remove(key);
    }

    pub fn is_running(&self, key: &ScopeKey) -> bool {
        self.lock().contains(key)
    }

    /// Keys currently held, sorted.
    pub fn running(&self) -> Vec<ScopeKey> {
        let mut keys: Vec<ScopeKey> = self.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Like [`try_acquire`](Self::try_acquire), but returns a guard that
    /// releases the key when dropped, on every exit path including unwinding.
    pub fn acquire(self: &Arc<Self>, key: &ScopeKey) -> Option<TaskGuard> {
        self.try_acquire(key).then(|| TaskGuard {
            registry: Arc::clone(self),
            key: key.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ScopeKey>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds one registry entry for the lifetime of a run.
#[derive(Debug)]
pub struct TaskGuard {
    registry: Arc<TaskRegistry>,
    key: ScopeKey,
}

impl TaskGuard {
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

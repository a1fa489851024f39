#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;

use mirrorsync_core::{
    CredentialHandle, Direction, EngineConfig, LimiterConfig, MirrorConfig, MirrorOptions, PairId,
    ProjectId, RemoteTarget, SyncPair, TargetId,
};
use mirrorsync_engine::{
    MemoryStateStore, OperationResult, RemoteClient, RemoteOperation, Scheduler,
    StaticConfigSource,
};

type Responder = Box<dyn Fn(&RemoteOperation) -> OperationResult + Send + Sync>;

/// Scripted remote: answers through `respond`, optionally parked on a gate
/// or delayed before answering.
pub struct FakeRemote {
    respond: Responder,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    log: Mutex<Vec<(TargetId, String)>>,
}

impl FakeRemote {
    pub fn ok() -> Self {
        Self::responding(|op| OperationResult::Ok(json!({ "id": project_of(op) })))
    }

    pub fn responding(
        respond: impl Fn(&RemoteOperation) -> OperationResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            gate: None,
            delay: None,
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every call waits until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<(TargetId, String)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn invoke(&self, target: &RemoteTarget, op: &RemoteOperation) -> OperationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push((target.id.clone(), format!("{op}:{}", project_of(op))));
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(op)
    }
}

pub fn project_of(op: &RemoteOperation) -> u64 {
    match op {
        RemoteOperation::UpsertMirror { project_id, .. }
        | RemoteOperation::TriggerUpdate { project_id, .. }
        | RemoteOperation::DeleteMirror { project_id, .. }
        | RemoteOperation::SyncIssues { project_id, .. } => project_id.0,
    }
}

pub fn target(id: &str) -> RemoteTarget {
    RemoteTarget {
        id: TargetId::from(id),
        base_url: format!("https://{id}.example.com"),
        credential: CredentialHandle("TOKEN".to_string()),
        label: None,
    }
}

pub fn pair(id: &str, source: &str, target: &str, direction: Direction, projects: &[u64]) -> SyncPair {
    let now = Utc::now();
    SyncPair {
        id: PairId::from(id),
        source: TargetId::from(source),
        target: TargetId::from(target),
        direction,
        defaults: MirrorOptions::default(),
        groups: vec![],
        mirrors: projects
            .iter()
            .map(|&p| MirrorConfig {
                project_id: ProjectId(p),
                project_path: format!("team/p{p}"),
                overrides: MirrorOptions::default(),
            })
            .collect(),
        sync_interval_secs: 3600,
        created_at: now,
        updated_at: now,
    }
}

/// No pacing, no retries, no inter-item delay.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        limiter: LimiterConfig {
            min_interval_ms: 0,
            max_retries: 0,
            backoff_base_ms: 1,
            backoff_multiplier: 2,
            backoff_max_ms: 10,
        },
        batch_item_delay_ms: 0,
        ..EngineConfig::default()
    }
}

pub fn scheduler(
    config: EngineConfig,
    pairs: Vec<SyncPair>,
    client: Arc<FakeRemote>,
) -> (Scheduler, Arc<MemoryStateStore>) {
    let store = Arc::new(MemoryStateStore::new(config.job_history));
    let source = StaticConfigSource::new(vec![target("a"), target("b"), target("c")], pairs);
    let scheduler = Scheduler::new(config, Arc::new(source), store.clone(), client);
    (scheduler, store)
}

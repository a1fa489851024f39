//! # mirrorsync-engine
//!
//! Resilient batch synchronization for mirror pairs.
//!
//! A [`Scheduler`] discovers due scopes, admits them through the
//! [`TaskRegistry`] and [`ConflictDetector`], and runs each one through the
//! [`RateLimiter`] (itself gated by a per-target [`CircuitBreaker`]). Every
//! run ends by writing a terminal job record and checkpoint through the
//! [`StateStore`].

pub mod breaker;
pub mod conflict;
pub mod error;
pub mod executor;
pub mod http;
pub mod limiter;
pub mod remote;
pub mod scheduler;
pub mod source;
pub mod staleness;
pub mod store;
pub mod tasks;

pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker};
pub use conflict::{ConflictDetector, ConflictLog};
pub use error::EngineError;
pub use http::HttpRemoteClient;
pub use limiter::{CallOutcome, RateLimiter};
pub use remote::{OperationResult, RemoteClient, RemoteOperation};
pub use scheduler::{
    BatchResult, ItemError, JobHandle, RunReport, ScopeStatus, Scheduler, SkipReason,
    SkippedItem,
};
pub use source::{ConfigSource, RegistryConfigSource, StaticConfigSource};
pub use staleness::DueSignal;
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use tasks::{TaskGuard, TaskRegistry};

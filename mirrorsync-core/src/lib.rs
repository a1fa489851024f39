//! mirrorsync core library: domain types, engine configuration, settings
//! resolution, and the YAML configuration registry.
//!
//! - [`types`]: newtypes and domain structs
//! - [`config`]: [`EngineConfig`] tuning knobs
//! - [`settings`]: layered mirror/group/pair option resolution
//! - [`registry`]: load / save / list targets and pairs
//! - [`error`]: [`RegistryError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod settings;
pub mod types;

pub use config::{BreakerConfig, ConflictConfig, EngineConfig, LimiterConfig, TieBreak};
pub use error::RegistryError;
pub use settings::{resolve, EffectiveSettings, MirrorOptions};
pub use types::{
    BreakerState, Checkpoint, CheckpointStatus, ConflictRecord, CredentialHandle, Direction,
    ErrorCategory, GroupConfig, JobError, JobId, JobStatus, MirrorConfig, PairId, ProjectId,
    RemoteTarget, ScopeKey, SyncJob, SyncPair, TargetId,
};

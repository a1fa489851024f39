//! Error types for mirrorsync-engine.

use std::path::PathBuf;

use thiserror::Error;

use mirrorsync_core::{PairId, RegistryError, ScopeKey, TargetId};

/// Errors that escape the engine.
///
/// Remote failures are not errors at this level: they become job outcomes.
/// These cover configuration lookups and local state persistence.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error from the configuration registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (state store).
    #[error("state store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown pair '{0}'")]
    UnknownPair(PairId),

    #[error("no mirror configured for scope {0}")]
    UnknownScope(ScopeKey),

    #[error("pair '{pair}' references unknown target '{target}'")]
    UnknownTarget { pair: PairId, target: TargetId },

    /// A blocking or spawned task failed to complete.
    #[error("task join error: {0}")]
    Join(String),
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}

//! Error types for mirrorsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from registry and config operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.mirrorsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The requested entity file did not exist at the expected path.
    #[error("not found at {path}")]
    NotFound { path: PathBuf },

    /// A pair references a target id that has no target file.
    #[error("pair '{pair}' references unknown target '{target}'")]
    UnknownTarget { pair: String, target: String },

    /// A pair's source and target are the same instance.
    #[error("pair '{pair}' uses '{target}' as both source and target")]
    SelfPair { pair: String, target: String },
}

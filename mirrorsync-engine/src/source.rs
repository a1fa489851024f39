//! Where the scheduler reads targets and pairs from.

use std::path::PathBuf;

use mirrorsync_core::{registry, PairId, RemoteTarget, SyncPair, TargetId};

use crate::error::EngineError;

/// Configuration provider for the scheduler. Read on every tick, so edits to
/// the registry take effect without a restart.
pub trait ConfigSource: Send + Sync {
    fn targets(&self) -> Result<Vec<RemoteTarget>, EngineError>;
    fn pairs(&self) -> Result<Vec<SyncPair>, EngineError>;

    fn pair(&self, id: &PairId) -> Result<SyncPair, EngineError> {
        self.pairs()?
            .into_iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| EngineError::UnknownPair(id.clone()))
    }

    fn target(&self, pair: &SyncPair, id: &TargetId) -> Result<RemoteTarget, EngineError> {
        self.targets()?
            .into_iter()
            .find(|t| &t.id == id)
            .ok_or_else(|| EngineError::UnknownTarget {
                pair: pair.id.clone(),
                target: id.clone(),
            })
    }
}

/// Reads the YAML registry under `<home>/.mirrorsync`.
#[derive(Debug, Clone)]
pub struct RegistryConfigSource {
    home: PathBuf,
}

impl RegistryConfigSource {
    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn open() -> Result<Self, EngineError> {
        Ok(Self::at(registry::home()?))
    }
}

impl ConfigSource for RegistryConfigSource {
    fn targets(&self) -> Result<Vec<RemoteTarget>, EngineError> {
        Ok(registry::list_targets_at(&self.home)?)
    }

    fn pairs(&self) -> Result<Vec<SyncPair>, EngineError> {
        Ok(registry::list_pairs_at(&self.home)?)
    }

    fn pair(&self, id: &PairId) -> Result<SyncPair, EngineError> {
        match registry::load_pair_at(&self.home, id) {
            Ok(pair) => Ok(pair),
            Err(mirrorsync_core::RegistryError::NotFound { .. }) => {
                Err(EngineError::UnknownPair(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed in-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    pub targets: Vec<RemoteTarget>,
    pub pairs: Vec<SyncPair>,
}

impl StaticConfigSource {
    pub fn new(targets: Vec<RemoteTarget>, pairs: Vec<SyncPair>) -> Self {
        Self { targets, pairs }
    }
}

impl ConfigSource for StaticConfigSource {
    fn targets(&self) -> Result<Vec<RemoteTarget>, EngineError> {
        Ok(self.targets.clone())
    }

    fn pairs(&self) -> Result<Vec<SyncPair>, EngineError> {
        Ok(self.pairs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorsync_core::{CredentialHandle, Direction};
    use tempfile::TempDir;

    fn target(id: &str) -> RemoteTarget {
        RemoteTarget {
            id: TargetId::from(id),
            base_url: format!("https://{id}.example.com"),
            credential: CredentialHandle("TOKEN".into()),
            label: None,
        }
    }

    #[test]
    fn registry_source_reads_yaml_and_maps_missing_pair() {
        let home = TempDir::new().unwrap();
        registry::save_target_at(home.path(), &target("a")).unwrap();
        registry::save_target_at(home.path(), &target("b")).unwrap();
        registry::add_pair_at(
            home.path(),
            PairId::from("a-to-b"),
            TargetId::from("a"),
            TargetId::from("b"),
            Direction::Push,
        )
        .unwrap();

        let source = RegistryConfigSource::at(home.path());
        assert_eq!(source.targets().unwrap().len(), 2);
        let pair = source.pair(&PairId::from("a-to-b")).unwrap();
        assert_eq!(source.target(&pair, &pair.target).unwrap().id, TargetId::from("b"));
        assert!(matches!(
            source.pair(&PairId::from("nope")),
            Err(EngineError::UnknownPair(_))
        ));
    }

    #[test]
    fn static_source_reports_unknown_pair() {
        let source = StaticConfigSource::new(vec![target("a")], vec![]);
        assert!(matches!(
            source.pair(&PairId::from("x")),
            Err(EngineError::UnknownPair(_))
        ));
    }
}

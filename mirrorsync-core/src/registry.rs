//! YAML configuration registry for targets and pairs.
//!
//! # Storage layout
//!
//! ```text
//! ~/.mirrorsync/
//!   targets/
//!     <target_id>.yaml   (one RemoteTarget per file: mode 0600)
//!   pairs/
//!     <pair_id>.yaml     (one SyncPair, with groups + mirrors: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RegistryError;
use crate::settings::MirrorOptions;
use crate::types::{Direction, MirrorConfig, PairId, ProjectId, RemoteTarget, SyncPair, TargetId};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.mirrorsync/`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".mirrorsync")
}

/// `<home>/.mirrorsync/targets/`
pub fn targets_dir_at(home: &Path) -> PathBuf {
    root_at(home).join("targets")
}

/// `<home>/.mirrorsync/pairs/`
pub fn pairs_dir_at(home: &Path) -> PathBuf {
    root_at(home).join("pairs")
}

/// `<home>/.mirrorsync/targets/<id>.yaml`: pure, no I/O.
pub fn target_path_at(home: &Path, id: &TargetId) -> PathBuf {
    targets_dir_at(home).join(format!("{}.yaml", id.0))
}

/// `<home>/.mirrorsync/pairs/<id>.yaml`: pure, no I/O.
pub fn pair_path_at(home: &Path, id: &PairId) -> PathBuf {
    pairs_dir_at(home).join(format!("{}.yaml", id.0))
}

// ---------------------------------------------------------------------------
// 2. Targets
// ---------------------------------------------------------------------------

pub fn load_target_at(home: &Path, id: &TargetId) -> Result<RemoteTarget, RegistryError> {
    load_yaml(&target_path_at(home, id))
}

/// All targets, sorted by id.
pub fn list_targets_at(home: &Path) -> Result<Vec<RemoteTarget>, RegistryError> {
    let mut targets: Vec<RemoteTarget> = list_yaml(&targets_dir_at(home))?;
    targets.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(targets)
}

pub fn list_targets() -> Result<Vec<RemoteTarget>, RegistryError> {
    list_targets_at(&home()?)
}

/// Atomically save a target. Overwrites an existing file with the same id.
pub fn save_target_at(home: &Path, target: &RemoteTarget) -> Result<(), RegistryError> {
    save_yaml(&targets_dir_at(home), &target_path_at(home, &target.id), target)
}

pub fn save_target(target: &RemoteTarget) -> Result<(), RegistryError> {
    save_target_at(&home()?, target)
}

// ---------------------------------------------------------------------------
// 3. Pairs
// ---------------------------------------------------------------------------

/// Load a single pair. Returns `RegistryError::NotFound` if absent,
/// `RegistryError::Parse` (with path + line context) if malformed YAML.
pub fn load_pair_at(home: &Path, id: &PairId) -> Result<SyncPair, RegistryError> {
    load_yaml(&pair_path_at(home, id))
}

pub fn load_pair(id: &PairId) -> Result<SyncPair, RegistryError> {
    load_pair_at(&home()?, id)
}

/// All pairs, sorted by id.
pub fn list_pairs_at(home: &Path) -> Result<Vec<SyncPair>, RegistryError> {
    let mut pairs: Vec<SyncPair> = list_yaml(&pairs_dir_at(home))?;
    pairs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(pairs)
}

pub fn list_pairs() -> Result<Vec<SyncPair>, RegistryError> {
    list_pairs_at(&home()?)
}

/// Atomically save a pair.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_pair_at(home: &Path, pair: &SyncPair) -> Result<(), RegistryError> {
    save_yaml(&pairs_dir_at(home), &pair_path_at(home, &pair.id), pair)
}

pub fn save_pair(pair: &SyncPair) -> Result<(), RegistryError> {
    save_pair_at(&home()?, pair)
}

/// Register a new pair between two existing targets.
///
/// Idempotent: if a pair with this id already exists it is returned unchanged.
pub fn add_pair_at(
    home: &Path,
    id: PairId,
    source: TargetId,
    target: TargetId,
    direction: Direction,
) -> Result<SyncPair, RegistryError> {
    let path = pair_path_at(home, &id);
    if path.exists() {
        return load_pair_at(home, &id);
    }
    if source == target {
        return Err(RegistryError::SelfPair {
            pair: id.0,
            target: source.0,
        });
    }
    for t in [&source, &target] {
        if !target_path_at(home, t).exists() {
            return Err(RegistryError::UnknownTarget {
                pair: id.0.clone(),
                target: t.0.clone(),
            });
        }
    }

    let now = Utc::now();
    let pair = SyncPair {
        id,
        source,
        target,
        direction,
        defaults: MirrorOptions::default(),
        groups: vec![],
        mirrors: vec![],
        sync_interval_secs: 3600,
        created_at: now,
        updated_at: now,
    };
    save_pair_at(home, &pair)?;
    Ok(pair)
}

pub fn add_pair(
    id: PairId,
    source: TargetId,
    target: TargetId,
    direction: Direction,
) -> Result<SyncPair, RegistryError> {
    add_pair_at(&home()?, id, source, target, direction)
}

/// Duplicate `pair` in the reverse direction under `reverse_id`, forming a
/// bidirectional relationship. Options, groups and mirrors are copied.
pub fn add_reverse_pair_at(
    home: &Path,
    pair: &PairId,
    reverse_id: PairId,
) -> Result<SyncPair, RegistryError> {
    let forward = load_pair_at(home, pair)?;
    let path = pair_path_at(home, &reverse_id);
    if path.exists() {
        return load_pair_at(home, &reverse_id);
    }
    let now = Utc::now();
    let reverse = SyncPair {
        id: reverse_id,
        source: forward.target.clone(),
        target: forward.source.clone(),
        created_at: now,
        updated_at: now,
        ..forward
    };
    save_pair_at(home, &reverse)?;
    Ok(reverse)
}

pub fn add_reverse_pair(pair: &PairId, reverse_id: PairId) -> Result<SyncPair, RegistryError> {
    add_reverse_pair_at(&home()?, pair, reverse_id)
}

/// Insert or replace a mirror (keyed by project id) within a pair.
pub fn upsert_mirror_at(
    home: &Path,
    pair: &PairId,
    mirror: MirrorConfig,
) -> Result<SyncPair, RegistryError> {
    let mut loaded = load_pair_at(home, pair)?;
    match loaded
        .mirrors
        .iter_mut()
        .find(|m| m.project_id == mirror.project_id)
    {
        Some(existing) => *existing = mirror,
        None => loaded.mirrors.push(mirror),
    }
    loaded.mirrors.sort_by_key(|m| m.project_id);
    loaded.updated_at = Utc::now();
    save_pair_at(home, &loaded)?;
    Ok(loaded)
}

pub fn upsert_mirror(pair: &PairId, mirror: MirrorConfig) -> Result<SyncPair, RegistryError> {
    upsert_mirror_at(&home()?, pair, mirror)
}

/// Remove a mirror from a pair. Returns `false` if the project was not
/// mirrored.
///
/// This only edits configuration. Callers drop the scope's checkpoint; a
/// mirror that should be torn down remotely is disabled first, not removed.
pub fn remove_mirror_at(
    home: &Path,
    pair: &PairId,
    project_id: ProjectId,
) -> Result<bool, RegistryError> {
    let mut loaded = load_pair_at(home, pair)?;
    let before = loaded.mirrors.len();
    loaded.mirrors.retain(|m| m.project_id != project_id);
    if loaded.mirrors.len() == before {
        return Ok(false);
    }
    loaded.updated_at = Utc::now();
    save_pair_at(home, &loaded)?;
    Ok(true)
}

pub fn remove_mirror(pair: &PairId, project_id: ProjectId) -> Result<bool, RegistryError> {
    remove_mirror_at(&home()?, pair, project_id)
}

/// Delete a pair's YAML file. Missing files are not an error.
pub fn remove_pair_at(home: &Path, id: &PairId) -> Result<bool, RegistryError> {
    let path = pair_path_at(home, id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub fn remove_pair(id: &PairId) -> Result<bool, RegistryError> {
    remove_pair_at(&home()?, id)
}

/// The user's home directory, for the no-arg wrappers.
pub fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, RegistryError> {
    if !path.exists() {
        return Err(RegistryError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn list_yaml<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, RegistryError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut out = Vec::new();
    for entry in entries {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(".yaml") {
            continue;
        }
        out.push(load_yaml(&entry.path())?);
    }
    Ok(out)
}

fn save_yaml<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), RegistryError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        set_dir_permissions(dir)?;
    }
    let tmp = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(value)?;
    std::fs::write(&tmp, yaml)?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

//! Registry error-message, atomic-write-safety, and listing integration tests.

use assert_fs::prelude::*;
use mirrorsync_core::{
    registry,
    types::{CredentialHandle, Direction, MirrorConfig, PairId, ProjectId, RemoteTarget, TargetId},
    RegistryError,
};
use predicates::prelude::predicate;
use std::fs;

fn target(id: &str) -> RemoteTarget {
    RemoteTarget {
        id: TargetId::from(id),
        base_url: format!("https://{id}.example.com"),
        credential: CredentialHandle("TOKEN".to_string()),
        label: Some(format!("{id} instance")),
    }
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_pair_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = registry::load_pair_at(home.path(), &PairId::from("a-b")).unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("a-b.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".mirrorsync/pairs/a-b.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = registry::load_pair_at(home.path(), &PairId::from("a-b")).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("a-b.yaml"), "must contain file path");
}

#[test]
fn list_fails_loudly_on_one_bad_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::save_target_at(home.path(), &target("alpha")).expect("save");
    home.child(".mirrorsync/targets/broken.yaml")
        .write_str("- not a mapping\n")
        .expect("write");

    let err = registry::list_targets_at(home.path()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }));
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_cleans_up_tmp_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::save_target_at(home.path(), &target("alpha")).expect("save");

    home.child(".mirrorsync/targets/alpha.yaml")
        .assert(predicate::path::exists());
    home.child(".mirrorsync/targets/alpha.yaml.tmp")
        .assert(predicate::path::missing());
}

#[test]
fn leftover_tmp_file_is_ignored_by_listing() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::save_target_at(home.path(), &target("alpha")).expect("save");
    home.child(".mirrorsync/targets/beta.yaml.tmp")
        .write_str("partial write")
        .expect("write tmp");

    let targets = registry::list_targets_at(home.path()).expect("list");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, TargetId::from("alpha"));
}

#[cfg(unix)]
#[test]
fn saved_files_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::save_target_at(home.path(), &target("alpha")).expect("save");
    let path = registry::target_path_at(home.path(), &TargetId::from("alpha"));
    let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

// ---------------------------------------------------------------------------
// 3. Pair workflow
// ---------------------------------------------------------------------------

#[test]
fn pairs_listed_sorted_with_content() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    for id in ["alpha", "beta"] {
        registry::save_target_at(home.path(), &target(id)).expect("save");
    }
    for id in ["z-pair", "a-pair"] {
        registry::add_pair_at(
            home.path(),
            PairId::from(id),
            TargetId::from("alpha"),
            TargetId::from("beta"),
            Direction::Pull,
        )
        .expect("add");
    }

    let pairs = registry::list_pairs_at(home.path()).expect("list");
    let ids: Vec<&str> = pairs.iter().map(|p| p.id.0.as_str()).collect();
    assert_eq!(ids, ["a-pair", "z-pair"]);

    home.child(".mirrorsync/pairs/a-pair.yaml")
        .assert(predicate::str::contains("direction: pull"));
}

#[test]
fn mirrors_upsert_and_remove() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    for id in ["alpha", "beta"] {
        registry::save_target_at(home.path(), &target(id)).expect("save");
    }
    let pair = PairId::from("alpha-beta");
    registry::add_pair_at(
        home.path(),
        pair.clone(),
        TargetId::from("alpha"),
        TargetId::from("beta"),
        Direction::Push,
    )
    .expect("add");

    for (id, path) in [(9, "team/nine"), (2, "team/two")] {
        registry::upsert_mirror_at(
            home.path(),
            &pair,
            MirrorConfig {
                project_id: ProjectId(id),
                project_path: path.to_string(),
                overrides: Default::default(),
            },
        )
        .expect("upsert");
    }
    let loaded = registry::load_pair_at(home.path(), &pair).expect("load");
    let ids: Vec<u64> = loaded.mirrors.iter().map(|m| m.project_id.0).collect();
    assert_eq!(ids, [2, 9]);

    assert!(registry::remove_mirror_at(home.path(), &pair, ProjectId(9)).expect("remove"));
    assert!(!registry::remove_mirror_at(home.path(), &pair, ProjectId(9)).expect("remove again"));
    let loaded = registry::load_pair_at(home.path(), &pair).expect("load");
    assert_eq!(loaded.mirrors.len(), 1);
}

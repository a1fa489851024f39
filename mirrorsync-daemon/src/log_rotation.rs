//! Size-based rotation for the daemon's stdout/stderr logs.
//!
//! `daemon.log` → `daemon.log.1` → … → `daemon.log.<max_files>`; the oldest
//! copy is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rotate once a log reaches this size (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated copies kept per log.
pub const MAX_ROTATED_FILES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_LOG_BYTES,
            max_files: MAX_ROTATED_FILES,
        }
    }
}

/// Rotate `log_path` if it has reached `policy.max_bytes`.
///
/// Returns `false` when the file is under the threshold or missing. A fresh
/// empty file is left in place so the daemon's redirected output always has
/// somewhere to go.
pub fn rotate_if_needed(log_path: &Path, policy: &RotationPolicy) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < policy.max_bytes || policy.max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, policy.max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..policy.max_files).rev() {
        let from = numbered_path(log_path, n);
        if from.exists() {
            fs::rename(&from, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;
    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    Ok(true)
}

/// Rotate both daemon logs under `home`. Returns how many were rotated;
/// a failure on one file is logged and does not block the other.
pub fn rotate_logs(home: &Path, policy: &RotationPolicy) -> usize {
    let mut rotated = 0;
    for log_path in [
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
    ] {
        match rotate_if_needed(&log_path, policy) {
            Ok(true) => {
                rotated += 1;
                tracing::info!(path = %log_path.display(), "log file rotated");
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
    rotated
}

fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon.log");
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL: RotationPolicy = RotationPolicy {
        max_bytes: 64,
        max_files: 3,
    };

    #[test]
    fn small_or_missing_file_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        assert!(!rotate_if_needed(&log, &SMALL).unwrap());

        fs::write(&log, b"short").unwrap();
        assert!(!rotate_if_needed(&log, &SMALL).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_file_moves_to_first_copy() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        fs::write(&log, vec![b'x'; 100]).unwrap();

        assert!(rotate_if_needed(&log, &SMALL).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(fs::metadata(numbered_path(&log, 1)).unwrap().len(), 100);
    }

    #[test]
    fn copies_shift_and_cap_at_max_files() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        for round in 1..=5u8 {
            fs::write(&log, vec![b'0' + round; 64]).unwrap();
            rotate_if_needed(&log, &SMALL).unwrap();
        }

        // Newest first: .1 holds round 5, .3 holds round 3.
        assert_eq!(fs::read(numbered_path(&log, 1)).unwrap()[0], b'5');
        assert_eq!(fs::read(numbered_path(&log, 3)).unwrap()[0], b'3');
        assert!(!numbered_path(&log, 4).exists());
    }

    #[test]
    fn rotate_logs_handles_both_daemon_files() {
        let home = TempDir::new().unwrap();
        let logs = crate::paths::logs_dir(home.path());
        fs::create_dir_all(&logs).unwrap();
        fs::write(crate::paths::stdout_log_path(home.path()), vec![b'o'; 80]).unwrap();
        fs::write(crate::paths::stderr_log_path(home.path()), b"tiny").unwrap();

        assert_eq!(rotate_logs(home.path(), &SMALL), 1);
        assert!(logs.join("daemon.log.1").exists());
        assert!(!logs.join("daemon-err.log.1").exists());
    }

    #[test]
    fn default_policy_is_ten_mib_by_five() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.max_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.max_files, 5);
    }
}

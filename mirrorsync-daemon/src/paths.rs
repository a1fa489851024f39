use std::path::{Path, PathBuf};
use std::time::Duration;

use mirrorsync_core::registry;

/// Config edits landing within this window collapse into one tick.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_PID: &str = "daemon.pid";

pub fn mirrorsync_root(home: &Path) -> PathBuf {
    registry::root_at(home)
}

pub fn run_dir(home: &Path) -> PathBuf {
    mirrorsync_root(home).join("run")
}

pub fn pid_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_PID)
}

pub fn socket_path(home: &Path) -> PathBuf {
    mirrorsync_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    mirrorsync_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

/// Directories whose YAML files feed the scheduler.
pub fn watched_dirs(home: &Path) -> [PathBuf; 2] {
    [registry::targets_dir_at(home), registry::pairs_dir_at(home)]
}

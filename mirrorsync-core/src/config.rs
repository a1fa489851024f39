//! Engine tuning, loaded from `~/.mirrorsync/config.yaml`.
//!
//! Every field has a serde default, so a missing file or an empty mapping
//! yields [`EngineConfig::default`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::types::{Direction, TargetId};

/// Pacing and retry policy for outbound calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Minimum delay between two calls to the same target.
    pub min_interval_ms: u64,
    /// Retries after the first attempt for rate-limited or transient results.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: u32,
    pub backoff_max_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 200,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2,
            backoff_max_ms: 60_000,
        }
    }
}

impl LimiterConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Backoff before retry number `retry` (zero-based), capped at the maximum.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier.max(1)).saturating_pow(retry);
        let ms = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive trial successes that close a half-open breaker.
    pub success_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Ordering applied to reverse scopes that become due in the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep configuration order (pair id, then project id).
    #[default]
    FirstConfigured,
    PushFirst,
    PullFirst,
}

impl TieBreak {
    /// Sort rank for a direction; lower runs first.
    pub fn rank(self, direction: Direction) -> u8 {
        match (self, direction) {
            (TieBreak::FirstConfigured, _) => 0,
            (TieBreak::PushFirst, Direction::Push) | (TieBreak::PullFirst, Direction::Pull) => 0,
            _ => 1,
        }
    }
}

/// Cross-instance conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// How long after a job finishes its reverse scope stays blocked.
    pub window_secs: u64,
    pub tie_break: TieBreak,
    /// Conflict records kept for status queries.
    pub history: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            tie_break: TieBreak::FirstConfigured,
            history: 100,
        }
    }
}

/// Per-target overrides for pacing and breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TargetOverrides {
    pub min_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limiter: LimiterConfig,
    pub breaker: BreakerConfig,
    pub conflict: ConflictConfig,
    /// A run exceeding this is abandoned and marked failed.
    pub run_timeout_secs: u64,
    /// Delay between items of a batch run.
    pub batch_item_delay_ms: u64,
    /// Wait before a failed or partial scope is retried.
    pub retry_delay_secs: u64,
    /// Daemon tick period.
    pub tick_interval_secs: u64,
    /// Terminal jobs kept in the journal.
    pub job_history: usize,
    pub targets: HashMap<TargetId, TargetOverrides>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            breaker: BreakerConfig::default(),
            conflict: ConflictConfig::default(),
            run_timeout_secs: 300,
            batch_item_delay_ms: 200,
            retry_delay_secs: 300,
            tick_interval_secs: 60,
            job_history: 500,
            targets: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn batch_item_delay(&self) -> Duration {
        Duration::from_millis(self.batch_item_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    /// Limiter policy for `target`, with per-target overrides applied.
    pub fn limiter_for(&self, target: &TargetId) -> LimiterConfig {
        let mut cfg = self.limiter.clone();
        if let Some(o) = self.targets.get(target) {
            if let Some(v) = o.min_interval_ms {
                cfg.min_interval_ms = v;
            }
            if let Some(v) = o.max_retries {
                cfg.max_retries = v;
            }
        }
        cfg
    }

    /// Breaker thresholds for `target`, with per-target overrides applied.
    pub fn breaker_for(&self, target: &TargetId) -> BreakerConfig {
        let mut cfg = self.breaker.clone();
        if let Some(o) = self.targets.get(target) {
            if let Some(v) = o.failure_threshold {
                cfg.failure_threshold = v;
            }
            if let Some(v) = o.success_threshold {
                cfg.success_threshold = v;
            }
            if let Some(v) = o.cooldown_ms {
                cfg.cooldown_ms = v;
            }
        }
        cfg
    }
}

/// `<home>/.mirrorsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".mirrorsync").join("config.yaml")
}

/// Load engine config; a missing file yields defaults.
pub fn load_at(home: &Path) -> Result<EngineConfig, RegistryError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    if contents.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// Write engine config atomically (`.tmp` sibling + rename).
pub fn save_at(home: &Path, config: &EngineConfig) -> Result<(), RegistryError> {
    let path = config_path_at(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, serde_yaml::to_string(config)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("home");
        let cfg = load_at(home.path()).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.limiter.min_interval_ms, 200);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let home = TempDir::new().expect("home");
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "limiter:\n  max_retries: 7\nconflict:\n  tie_break: push_first\n")
            .unwrap();

        let cfg = load_at(home.path()).expect("load");
        assert_eq!(cfg.limiter.max_retries, 7);
        assert_eq!(cfg.limiter.min_interval_ms, 200);
        assert_eq!(cfg.conflict.tie_break, TieBreak::PushFirst);
        assert_eq!(cfg.breaker, BreakerConfig::default());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = LimiterConfig {
            backoff_base_ms: 100,
            backoff_multiplier: 2,
            backoff_max_ms: 500,
            ..LimiterConfig::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2), Duration::from_millis(400));
        assert_eq!(cfg.backoff(3), Duration::from_millis(500));
        assert_eq!(cfg.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn target_overrides_apply_per_target() {
        let mut cfg = EngineConfig::default();
        cfg.targets.insert(
            TargetId::from("slow"),
            TargetOverrides {
                min_interval_ms: Some(1_000),
                failure_threshold: Some(2),
                ..TargetOverrides::default()
            },
        );
        assert_eq!(cfg.limiter_for(&TargetId::from("slow")).min_interval_ms, 1_000);
        assert_eq!(cfg.limiter_for(&TargetId::from("fast")).min_interval_ms, 200);
        assert_eq!(cfg.breaker_for(&TargetId::from("slow")).failure_threshold, 2);
    }

    #[test]
    fn tie_break_ranks() {
        assert_eq!(TieBreak::PushFirst.rank(Direction::Push), 0);
        assert_eq!(TieBreak::PushFirst.rank(Direction::Pull), 1);
        assert_eq!(TieBreak::PullFirst.rank(Direction::Pull), 0);
        assert_eq!(TieBreak::FirstConfigured.rank(Direction::Pull), 0);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let home = TempDir::new().expect("home");
        let mut cfg = EngineConfig::default();
        cfg.run_timeout_secs = 42;
        save_at(home.path(), &cfg).expect("save");
        assert_eq!(load_at(home.path()).expect("load"), cfg);
        assert!(!config_path_at(home.path()).with_extension("yaml.tmp").exists());
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use montage_types::TaskKind;

/// Runtime configuration: defaults in code, overridden by
/// `{state_dir}/config.json`, overridden by `MONTAGE_*` environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MontageConfig {
    pub state_dir: PathBuf,
    /// Bound on every external store call.
    pub io_timeout_secs: u64,
    /// Deadline for an in-progress task before the watchdog fails it.
    pub task_timeout_secs: u64,
    /// Per-kind overrides of the task deadline.
    pub task_timeout_overrides: HashMap<TaskKind, u64>,
    pub approval_timeout_minutes: u64,
    /// Auto-approve instead of escalating when an approval times out twice.
    pub auto_approve_on_timeout: bool,
    /// Event retention for projects in a terminal status.
    pub retention_days: u64,
    /// Per-project queue depth that triggers backpressure.
    pub queue_high_water: usize,
    pub budget_warn_ratio: f64,
    pub budget_stop_ratio: f64,
    /// Hard ceiling: spent beyond total x this multiplier force-aborts.
    pub force_abort_multiplier: f64,
    pub cache_ttl_secs: u64,
    pub hybrid_overlay_gain: f64,
    pub redelivery_limit: u32,
    pub max_chain_depth: usize,
    pub scheduler_tick_ms: u64,
    pub watchdog_tick_ms: u64,
    pub approval_scan_ms: u64,
}

impl Default for MontageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".montage"),
            io_timeout_secs: 5,
            task_timeout_secs: 300,
            task_timeout_overrides: HashMap::new(),
            approval_timeout_minutes: 60,
            auto_approve_on_timeout: false,
            retention_days: 30,
            queue_high_water: 1000,
            budget_warn_ratio: 0.8,
            budget_stop_ratio: 1.0,
            force_abort_multiplier: 1.2,
            cache_ttl_secs: 3600,
            hybrid_overlay_gain: 0.3,
            redelivery_limit: 3,
            max_chain_depth: 100,
            scheduler_tick_ms: 250,
            watchdog_tick_ms: 1000,
            approval_scan_ms: 1000,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

impl MontageConfig {
    /// Load from `{state_dir}/config.json` (if present) and apply
    /// environment overrides.
    pub fn load(state_dir_flag: Option<PathBuf>) -> Self {
        let state_dir = resolve_state_dir(state_dir_flag);
        let mut config = match std::fs::read_to_string(state_dir.join("config.json")) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(mut value) => {
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert(
                            "state_dir".to_string(),
                            Value::String(state_dir.display().to_string()),
                        );
                    }
                    serde_json::from_value(value).unwrap_or_default()
                }
                Err(_) => Self::default(),
            },
            Err(_) => Self::default(),
        };
        config.state_dir = state_dir;
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_u64("MONTAGE_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = v;
        }
        if let Some(v) = env_u64("MONTAGE_APPROVAL_TIMEOUT_MINUTES") {
            self.approval_timeout_minutes = v;
        }
        if let Some(v) = env_u64("MONTAGE_RETENTION_DAYS") {
            self.retention_days = v;
        }
        if let Some(v) = env_u64("MONTAGE_QUEUE_HIGH_WATER") {
            self.queue_high_water = v as usize;
        }
        if let Ok(v) = std::env::var("MONTAGE_AUTO_APPROVE_ON_TIMEOUT") {
            self.auto_approve_on_timeout = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn state_db(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    pub fn events_db(&self) -> PathBuf {
        self.state_dir.join("events.db")
    }

    pub fn queue_db(&self) -> PathBuf {
        self.state_dir.join("queue.db")
    }

    pub fn locks_db(&self) -> PathBuf {
        self.state_dir.join("locks.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn mapper_table_path(&self) -> PathBuf {
        self.state_dir.join("mapper.json")
    }

    pub fn task_timeout(&self, kind: TaskKind) -> Duration {
        let secs = self
            .task_timeout_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.task_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn approval_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.approval_timeout_minutes as i64)
    }
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var("MONTAGE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".montage")
}

pub fn config_for_dir(dir: &Path) -> MontageConfig {
    MontageConfig {
        state_dir: dir.to_path_buf(),
        ..MontageConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MontageConfig::default();
        assert_eq!(config.task_timeout_secs, 300);
        assert_eq!(config.approval_timeout_minutes, 60);
        assert_eq!(config.queue_high_water, 1000);
        assert!((config.budget_warn_ratio - 0.8).abs() < f64::EPSILON);
        assert!((config.force_abort_multiplier - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn per_kind_timeout_override_wins() {
        let mut config = MontageConfig::default();
        config
            .task_timeout_overrides
            .insert(TaskKind::GenerateFinalVideo, 900);
        assert_eq!(
            config.task_timeout(TaskKind::GenerateFinalVideo),
            Duration::from_secs(900)
        );
        assert_eq!(
            config.task_timeout(TaskKind::WriteScript),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn config_file_overrides_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{"task_timeout_secs": 60, "queue_high_water": 10}"#,
        )
        .unwrap();
        let config = MontageConfig::load(Some(tmp.path().to_path_buf()));
        assert_eq!(config.task_timeout_secs, 60);
        assert_eq!(config.queue_high_water, 10);
        assert_eq!(config.retention_days, 30);
    }
}

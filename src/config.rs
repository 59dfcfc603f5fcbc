use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CACHE_TTL_MS: u64 = 2_000;
const DEFAULT_RECONCILE_SECONDS: u64 = 10 * 60;
const DEFAULT_AGGREGATE_CAPACITY: u64 = 10_000;
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Tunables for one [`crate::engine::UsageEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub gemini_home: PathBuf,
    /// How long the last full query result may be served without rescanning.
    pub result_cache_ttl: Duration,
    /// Period of the forced full stat sweep.
    pub reconciliation_interval: Duration,
    /// Upper bound on per-session aggregate entries kept in memory.
    pub aggregate_cache_capacity: usize,
    pub default_limit: usize,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            gemini_home: gemini_home(),
            result_cache_ttl: Duration::from_millis(env_u64(
                "GEMINI_USAGE_CACHE_TTL_MS",
                DEFAULT_CACHE_TTL_MS,
            )),
            reconciliation_interval: Duration::from_secs(env_u64(
                "GEMINI_USAGE_RECONCILE_SECONDS",
                DEFAULT_RECONCILE_SECONDS,
            )),
            aggregate_cache_capacity: env_u64(
                "GEMINI_USAGE_AGGREGATE_CAPACITY",
                DEFAULT_AGGREGATE_CAPACITY,
            ) as usize,
            default_limit: DEFAULT_QUERY_LIMIT,
        }
    }

    /// Default tunables rooted at an explicit home directory.
    pub fn for_home(gemini_home: impl Into<PathBuf>) -> Self {
        Self {
            gemini_home: gemini_home.into(),
            result_cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            reconciliation_interval: Duration::from_secs(DEFAULT_RECONCILE_SECONDS),
            aggregate_cache_capacity: DEFAULT_AGGREGATE_CAPACITY as usize,
            default_limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn tmp_path(&self) -> PathBuf {
        tmp_path(&self.gemini_home)
    }
}

pub fn gemini_home() -> PathBuf {
    if let Ok(custom) = env::var("GEMINI_CLI_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gemini")
}

/// Session storage root: one directory per project hash lives below it.
pub fn tmp_path(home: &Path) -> PathBuf {
    home.join("tmp")
}

pub fn is_installed(home: &Path) -> bool {
    home.exists() || tmp_path(home).exists()
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn settings_for_home_use_defaults() {
        let settings = EngineSettings::for_home("/data/.gemini");
        assert_eq!(settings.tmp_path(), PathBuf::from("/data/.gemini/tmp"));
        assert_eq!(settings.result_cache_ttl, Duration::from_secs(2));
        assert_eq!(settings.reconciliation_interval, Duration::from_secs(600));
        assert_eq!(settings.aggregate_cache_capacity, 10_000);
        assert_eq!(settings.default_limit, 100);
    }

    #[test]
    fn installed_when_home_or_tmp_exists() {
        let tmp = TempDir::new().expect("temp dir");
        let home = tmp.path().join(".gemini");
        assert!(!is_installed(&home));

        std::fs::create_dir_all(home.join("tmp")).expect("create tmp");
        assert!(is_installed(&home));
    }

    #[test]
    fn env_u64_ignores_missing_values() {
        assert_eq!(env_u64("GEMINI_USAGE_TEST_UNSET_VARIABLE", 7), 7);
    }
}

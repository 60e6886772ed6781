//! Configuration and identity resolution
//!
//! Precedence, lowest first: built-in defaults, YAML file (`$TM_CONFIG`,
//! else `config.yml` next to the database), environment, `--db` flag.

use crate::core::{Result, StoreOptions, TaskError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DB_FILE: &str = "tasks.db";
const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub busy_retries: u32,
    pub retry_backoff_ms: u64,
    pub watch_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: 5000,
            busy_retries: 3,
            retry_backoff_ms: 200,
            watch_interval_ms: 1000,
        }
    }
}

/// `~/.tasklane/tasks.db`
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tasklane")
        .join(DB_FILE)
}

impl Config {
    /// Resolve from the process environment
    pub fn load(db_flag: Option<&Path>) -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok(), db_flag)
    }

    /// Resolve with an injectable environment lookup
    pub fn resolve<E>(env: E, db_flag: Option<&Path>) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        // Where the database will end up decides where the default config file is
        let db_override = db_flag
            .map(Path::to_path_buf)
            .or_else(|| lookup("TM_DB").map(PathBuf::from))
            .or_else(|| lookup("TM_DB_DIR").map(|dir| PathBuf::from(dir).join(DB_FILE)));

        let mut config = match lookup("TM_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                let db = db_override.clone().unwrap_or_else(default_db_path);
                let candidate = db
                    .parent()
                    .map(|dir| dir.join(CONFIG_FILE))
                    .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(db) = db_override {
            config.db_path = db;
        }
        if let Some(ms) = lookup("TM_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = ms.trim().parse().map_err(|_| {
                TaskError::Config(format!("TM_BUSY_TIMEOUT_MS must be milliseconds, got '{}'", ms))
            })?;
        }
        Ok(config)
    }

    /// Parse a YAML config file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| TaskError::Config(format!("invalid {}: {}", path.display(), e)))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            busy_retries: self.busy_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }
}

/// Who is running the command: `TM_ACTOR`, `USER`, `USERNAME`, else `unknown`
pub fn resolve_actor<E>(env: E) -> String
where
    E: Fn(&str) -> Option<String>,
{
    ["TM_ACTOR", "USER", "USERNAME"]
        .iter()
        .filter_map(|key| env(key))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// What `--me` means: `TM_ASSIGNEE` when set, else the actor
pub fn resolve_me<E>(env: E, actor: &str) -> String
where
    E: Fn(&str) -> Option<String>,
{
    env("TM_ASSIGNEE")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| actor.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.db_path.ends_with(".tasklane/tasks.db"));
        assert_eq!(config.store_options().busy_retries, 3);
        assert_eq!(config.watch_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        let dir = TempDir::new().unwrap();
        let dir_str = dir.path().to_string_lossy().to_string();
        let config = Config::resolve(
            env_of(&[("TM_DB_DIR", dir_str.as_str()), ("TM_BUSY_TIMEOUT_MS", "250")]),
            None,
        )
        .unwrap();
        assert_eq!(config.db_path, dir.path().join("tasks.db"));
        assert_eq!(config.busy_timeout_ms, 250);
    }

    #[test]
    fn test_flag_beats_env() {
        let dir = TempDir::new().unwrap();
        let flag = dir.path().join("flag.db");
        let config = Config::resolve(env_of(&[("TM_DB", "/nowhere/env.db")]), Some(&flag)).unwrap();
        assert_eq!(config.db_path, flag);
    }

    #[test]
    fn test_yaml_next_to_database() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "busy_retries: 7\nwatch_interval_ms: 50\n",
        )
        .unwrap();
        let db = dir.path().join("tasks.db");
        let config = Config::resolve(env_of(&[]), Some(&db)).unwrap();
        assert_eq!(config.busy_retries, 7);
        assert_eq!(config.watch_interval_ms, 50);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.db_path, db);
    }

    #[test]
    fn test_explicit_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.yml");
        let missing = path.to_string_lossy().to_string();
        let err = Config::resolve(env_of(&[("TM_CONFIG", missing.as_str())]), None).unwrap_err();
        assert!(matches!(err, TaskError::Config(_)));

        std::fs::write(&path, "busy_retries: [oops]\n").unwrap();
        let err = Config::resolve(env_of(&[("TM_CONFIG", missing.as_str())]), None).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_bad_timeout() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("tasks.db");
        let err = Config::resolve(env_of(&[("TM_BUSY_TIMEOUT_MS", "soon")]), Some(&db)).unwrap_err();
        assert!(err.to_string().contains("TM_BUSY_TIMEOUT_MS"));
    }

    #[test]
    fn test_identity() {
        assert_eq!(resolve_actor(env_of(&[("TM_ACTOR", "agent-1"), ("USER", "bob")])), "agent-1");
        assert_eq!(resolve_actor(env_of(&[("TM_ACTOR", " "), ("USER", "bob")])), "bob");
        assert_eq!(resolve_actor(env_of(&[("USERNAME", "carol")])), "carol");
        assert_eq!(resolve_actor(env_of(&[])), "unknown");

        assert_eq!(resolve_me(env_of(&[("TM_ASSIGNEE", "dave")]), "bob"), "dave");
        assert_eq!(resolve_me(env_of(&[("TM_ASSIGNEE", "")]), "bob"), "bob");
    }
}

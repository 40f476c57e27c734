//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/campus/config.toml)
//! 3. Environment variables (CAMPUS_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "CAMPUS";

/// Default delay before an unused remote listener is detached
const DEFAULT_LISTENER_GRACE_MS: u64 = 2000;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite cache)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Realtime server URL (ws:// or wss://)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Signed-in user id
    #[serde(default)]
    pub user_id: Option<String>,

    /// How long a listener with no subscribers stays attached
    #[serde(default = "default_listener_grace_ms")]
    pub listener_grace_ms: u64,

    /// Log level for the CLI subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            user_id: None,
            listener_grace_ms: DEFAULT_LISTENER_GRACE_MS,
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CAMPUS_DATA_DIR, CAMPUS_REMOTE_URL, ...)
    /// 2. Config file (~/.config/campus/config.toml or CAMPUS_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the remote
        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_USER_ID", ENV_PREFIX)) {
            self.user_id = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_LISTENER_GRACE_MS", ENV_PREFIX)) {
            match val.parse() {
                Ok(ms) => self.listener_grace_ms = ms,
                Err(_) => tracing::warn!("Ignoring invalid {}_LISTENER_GRACE_MS={}", ENV_PREFIX, val),
            }
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CAMPUS_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("campus")
            .join("config.toml")
    }

    /// Get the path to the SQLite cache database
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.db")
    }

    /// Grace delay as a `Duration`
    pub fn listener_grace(&self) -> Duration {
        Duration::from_millis(self.listener_grace_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("campus")
}

fn default_listener_grace_ms() -> u64 {
    DEFAULT_LISTENER_GRACE_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "CAMPUS_DATA_DIR",
        "CAMPUS_REMOTE_URL",
        "CAMPUS_USER_ID",
        "CAMPUS_LISTENER_GRACE_MS",
        "CAMPUS_LOG_LEVEL",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.remote_url.is_none());
        assert!(config.user_id.is_none());
        assert_eq!(config.listener_grace_ms, 2000);
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.ends_with("campus"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.cache_path().ends_with("cache.db"));
        assert_eq!(config.listener_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CAMPUS_DATA_DIR", "/tmp/campus-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/campus-test"));
    }

    #[test]
    fn test_env_override_remote_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CAMPUS_REMOTE_URL", "ws://localhost:9000");
        config.apply_env_overrides();
        assert_eq!(config.remote_url, Some("ws://localhost:9000".to_string()));

        env::set_var("CAMPUS_REMOTE_URL", "");
        config.apply_env_overrides();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_env_override_grace_ignores_garbage() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CAMPUS_LISTENER_GRACE_MS", "150");
        config.apply_env_overrides();
        assert_eq!(config.listener_grace_ms, 150);

        env::set_var("CAMPUS_LISTENER_GRACE_MS", "soon");
        config.apply_env_overrides();
        assert_eq!(config.listener_grace_ms, 150);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/campus"),
            remote_url: Some("wss://rt.example.edu".to_string()),
            user_id: Some("u-42".to_string()),
            listener_grace_ms: 500,
            log_level: "debug".to_string(),
            log_file: None,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("remote_url"));
        assert!(toml_str.contains("listener_grace_ms"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.remote_url, config.remote_url);
        assert_eq!(parsed.user_id, config.user_id);
        assert_eq!(parsed.listener_grace_ms, 500);
    }

    #[test]
    fn test_load_from_str_fills_defaults() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_str(r#"user_id = "student-7""#).unwrap();
        assert_eq!(config.user_id.as_deref(), Some("student-7"));
        assert_eq!(config.listener_grace_ms, 2000);
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp = tempfile::TempDir::new().unwrap();
        env::set_var("CAMPUS_DATA_DIR", temp.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.remote_url.is_none());
        assert!(config.data_dir.exists());
    }
}

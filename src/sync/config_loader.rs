use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::kruoka::challenge::browser::BrowserOptions;
use crate::kruoka::rate_limiter::RateLimiterConfig;

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paths {
    pub database_file: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Api {
    pub base_url: String,
    pub site_url: String,
    pub cookie_domain: String,
    pub build_number: String,
    pub experiments: String,
    pub request_timeout_secs: u64,
}

impl Api {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Rate {
    pub min_interval_ms: u64,
    pub max_rate_limit_retries: u32,
    pub initial_backoff_secs: f64,
    pub max_reauth: u32,
}

impl Rate {
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Sync {
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub max_distance_km: f64,
    /// Fraction of failed stores above which the run exits non-zero
    pub failure_threshold: f64,
    pub workers: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Challenge {
    pub flaresolverr_url: Option<String>,
    pub captcha_api_key: Option<String>,
    pub browser_enabled: bool,
    pub browser_headless: bool,
    pub browser_profile_dir: String,
    pub browser_wait_secs: u64,
}

impl Challenge {
    pub fn browser_options(&self) -> BrowserOptions {
        BrowserOptions {
            headless: self.browser_headless,
            profile_dir: Some(PathBuf::from(&self.browser_profile_dir)),
            wait: Duration::from_secs(self.browser_wait_secs),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub paths: Paths,
    pub api: Api,
    pub rate: Rate,
    pub sync: Sync,
    pub logging: Logging,
    pub challenge: Challenge,
}

// Default implementation for AppConfig
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                database_file: "./data/kruoka.sqlite".to_string(),
                log_directory: "./logs".to_string(),
            },
            api: Api {
                base_url: "https://www.k-ruoka.fi/kr-api".to_string(),
                site_url: "https://www.k-ruoka.fi".to_string(),
                cookie_domain: ".k-ruoka.fi".to_string(),
                build_number: "29159".to_string(),
                experiments: "ab4d.10001.0!d2ae.10003.0!a.00145.0!a.00150.0!a.00154.1".to_string(),
                request_timeout_secs: 30,
            },
            rate: Rate {
                min_interval_ms: 500,
                max_rate_limit_retries: 4,
                initial_backoff_secs: 15.0,
                max_reauth: 1,
            },
            sync: Sync {
                // Helsinki
                center_latitude: 60.1699,
                center_longitude: 24.9384,
                max_distance_km: 50.0,
                failure_threshold: 0.25,
                workers: 1,
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "plain".to_string(),
                log_to_terminal: true,
                log_to_file: true,
            },
            challenge: Challenge {
                flaresolverr_url: None,
                captcha_api_key: None,
                browser_enabled: true,
                browser_headless: false,
                browser_profile_dir: "./.chrome-profile".to_string(),
                browser_wait_secs: 90,
            },
        }
    }
}

impl AppConfig {
    // Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    // Apply overrides from any key lookup; empty values count as unset
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get("FLARESOLVERR_URL") {
            self.challenge.flaresolverr_url = Some(url);
        }
        if let Some(key) = get("CAPTCHA_API_KEY") {
            self.challenge.captcha_api_key = Some(key);
        }
        if let Some(path) = get("KRUOKA_DB_PATH") {
            self.paths.database_file = path;
        }
        if let Some(level) = get("KRUOKA_LOG_LEVEL") {
            self.logging.log_level = level;
        }
        if let Some(flag) = get("KRUOKA_BROWSER_DISABLED") {
            if matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes") {
                self.challenge.browser_enabled = false;
            }
        }
    }
}

// Config manager owning the loaded configuration
pub struct ConfigManager {
    app_config: AppConfig,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Load config.toml from the directory, then apply environment overrides
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let existed = config_dir.join(CONFIG_FILE).exists();
        let app_config = Self::load_app_config(&config_dir)?;

        let mut manager = Self {
            app_config,
            config_dir,
        };

        // Written before env overrides so secrets never reach the file
        if !existed {
            let defaults = manager.app_config.clone();
            match manager.save_app_config(&defaults) {
                Ok(()) => info!(
                    "Created {} with default values",
                    manager.config_dir().join(CONFIG_FILE).display()
                ),
                Err(e) => warn!("Failed to write default config: {}", e),
            }
        }

        manager.app_config.apply_env_overrides();
        Ok(manager)
    }

    // Load app config from config.toml, falling back to defaults
    pub fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse {}: {}", CONFIG_FILE, e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) =
                    fs::rename(&config_path, config_path.with_extension("toml.backup"))
                {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                    if let Err(write_err) = fs::write(&config_path, toml_string) {
                        error!("Failed to write new config file: {}", write_err);
                    } else {
                        info!("Created new {} with default values", CONFIG_FILE);
                    }
                }

                Ok(default_config)
            }
        }
    }

    pub fn get_app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // Save app config to file
    pub fn save_app_config(&mut self, config: &AppConfig) -> ConfigResult<()> {
        fs::create_dir_all(&self.config_dir)?;
        let toml_string =
            toml::to_string_pretty(config).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(self.config_dir.join(CONFIG_FILE), toml_string)?;
        self.app_config = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = ConfigManager::load_app_config(dir.path()).unwrap();
        assert_eq!(config.rate.min_interval_ms, 500);
        assert_eq!(config.rate.max_rate_limit_retries, 4);
        assert_eq!(config.sync.max_distance_km, 50.0);
    }

    #[test]
    fn test_new_writes_missing_file() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("conf")).unwrap();

        assert!(manager.config_dir().join(CONFIG_FILE).is_file());
        let written = ConfigManager::load_app_config(manager.config_dir()).unwrap();
        assert_eq!(written.sync.workers, AppConfig::default().sync.workers);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let mut manager = ConfigManager {
            app_config: AppConfig::default(),
            config_dir: dir.path().to_path_buf(),
        };

        let mut changed = AppConfig::default();
        changed.sync.workers = 3;
        changed.challenge.flaresolverr_url = Some("http://localhost:8191/v1".to_string());
        manager.save_app_config(&changed).unwrap();

        let loaded = ConfigManager::load_app_config(dir.path()).unwrap();
        assert_eq!(loaded.sync.workers, 3);
        assert_eq!(
            loaded.challenge.flaresolverr_url.as_deref(),
            Some("http://localhost:8191/v1")
        );
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "this is = = not toml").unwrap();

        let config = ConfigManager::load_app_config(dir.path()).unwrap();
        assert_eq!(config.api.build_number, "29159");
        assert!(dir.path().join("config.toml.backup").exists());
        assert!(toml::from_str::<AppConfig>(&fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLARESOLVERR_URL", "http://solver:8191/v1"),
            ("CAPTCHA_API_KEY", "   "),
            ("KRUOKA_DB_PATH", "/tmp/x.sqlite"),
            ("KRUOKA_BROWSER_DISABLED", "true"),
        ]);

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.challenge.flaresolverr_url.as_deref(), Some("http://solver:8191/v1"));
        assert_eq!(config.challenge.captcha_api_key, None);
        assert_eq!(config.paths.database_file, "/tmp/x.sqlite");
        assert!(!config.challenge.browser_enabled);
        assert_eq!(config.logging.log_level, "info");
    }
}

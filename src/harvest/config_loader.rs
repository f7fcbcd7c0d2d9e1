use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

const CONFIG_FILE: &str = "config.toml";

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paths {
    pub download_directory: String,
    pub session_file: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionSettings {
    pub validity_days: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Scan {
    pub max_advancements: usize,
    pub scroll_step_px: i64,
    pub navigation_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub skip_patterns: Vec<String>,
    pub media_host_fragments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContainerSettings {
    /// Open multi-item posts and take every member; otherwise take the grid cover.
    #[serde(default)]
    pub expand_containers: bool,
    pub max_next_clicks: usize,
    pub max_members: usize,
    pub next_selector: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Download {
    pub concurrency: usize,
    pub spacing_ms: u64,
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub attempt_timeout_secs: u64,
    pub max_file_bytes: u64,
    pub user_agent: String,
    pub allowed_content_types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub paths: Paths,
    pub session: SessionSettings,
    pub scan: Scan,
    pub container: ContainerSettings,
    pub download: Download,
    pub logging: Logging,
}

// Default implementation for AppConfig
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                download_directory: "./downloads".to_string(),
                session_file: "./data/session.json".to_string(),
                log_directory: "./logs".to_string(),
            },
            session: SessionSettings { validity_days: 30 },
            scan: Scan {
                max_advancements: 40,
                scroll_step_px: 768,
                navigation_timeout_ms: 30_000,
                settle_delay_ms: 2_000,
                skip_patterns: ["profile_pic", "150x150", "s150x150", "320x320", "s320x320"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                media_host_fragments: ["cdninstagram", "fbcdn", "scontent"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            container: ContainerSettings {
                expand_containers: false,
                max_next_clicks: 10,
                max_members: 20,
                next_selector: r#"button[aria-label*="Next"], div[role="button"][aria-label*="Next"]"#
                    .to_string(),
            },
            download: Download {
                concurrency: 2,
                spacing_ms: 1_500,
                max_attempts: 3,
                base_retry_delay_ms: 1_000,
                max_retry_delay_ms: 60_000,
                attempt_timeout_secs: 30,
                // 50 MiB
                max_file_bytes: 52_428_800,
                user_agent: format!("feed_harvester/{}", env!("CARGO_PKG_VERSION")),
                allowed_content_types: vec!["image/".to_string(), "video/".to_string()],
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "line".to_string(),
                log_to_file: true,
            },
        }
    }
}

impl Scan {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

// Config manager to handle the configuration file
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        // Create the directory if it doesn't exist
        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;

        let manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_dir,
        };

        manager.create_default_configs()?;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse config.toml: {}", e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                    if let Err(write_err) = fs::write(&config_path, toml_string) {
                        error!("Failed to write new config file: {}", write_err);
                    } else {
                        info!("Created new config.toml with default values");
                    }
                }

                Ok(default_config)
            }
        }
    }

    // Get app config
    pub fn get_app_config(&self) -> ConfigResult<AppConfig> {
        self.app_config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.clone())
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let config_path = self.config_dir.join(CONFIG_FILE);
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(&config_path, toml_string)?;

        let mut app_config = self.app_config
            .write()
            .map_err(|e| ConfigError::LockError(e.to_string()))?;
        *app_config = config.clone();

        Ok(())
    }

    // Create the default config file if it doesn't exist
    pub fn create_default_configs(&self) -> ConfigResult<()> {
        let config_path = self.config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let default_config = AppConfig::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            fs::write(&config_path, toml_string)?;

            let mut app_config = self.app_config
                .write()
                .map_err(|e| ConfigError::LockError(e.to_string()))?;
            *app_config = default_config;
        }

        Ok(())
    }
}

// Helper function to create a ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<ConfigManager> {
    ConfigManager::new(config_dir)
}

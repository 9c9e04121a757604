use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Remote patient server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Server root (e.g., "https://emr.example.org/openmrs")
    pub base_url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }
}

/// Sync behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Park a registration as failed after this many retryable failures.
    /// Unset means keep retrying.
    pub max_attempts: Option<u32>,
    /// Seconds between passes in watch mode
    pub interval_secs: u64,
    /// Seconds before a submission claim left in flight may be taken over.
    /// Keep it well above the slowest submission.
    pub claim_lease_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            interval_secs: 60,
            claim_lease_secs: 15 * 60,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database holding the offline queue
    pub database_path: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub sync: SyncSettings,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    remote: Option<RemoteConfig>,
    sync: Option<SyncSettings>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("patreg.db"),
            ConfigSource::Default,
        );
        let mut config_file = None;
        let mut remote = RemoteConfig::default();
        let mut sync = SyncSettings::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(remote_config) = file_config.remote {
                remote = remote_config;
            }
            if let Some(sync_settings) = file_config.sync {
                if sync_settings.max_attempts == Some(0) {
                    return Err(ConfigError::InvalidSetting(
                        path.clone(),
                        "sync.max_attempts must be at least 1; leave it unset to retry forever",
                    ));
                }
                sync = sync_settings;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("PATREG_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("PATREG_SERVER_URL") {
            remote.base_url = Some(url);
        }
        if let Ok(user) = std::env::var("PATREG_USERNAME") {
            remote.username = Some(user);
        }
        if let Ok(password) = std::env::var("PATREG_PASSWORD") {
            remote.password = Some(password);
        }
        if let Ok(max) = std::env::var("PATREG_MAX_ATTEMPTS") {
            let parsed = max
                .parse::<u32>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| ConfigError::InvalidEnv("PATREG_MAX_ATTEMPTS", max.clone()))?;
            sync.max_attempts = Some(parsed);
        }

        Ok(Self {
            database_path,
            config_file,
            remote,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/patreg/
    /// - macOS: ~/Library/Application Support/patreg/
    /// - Windows: %APPDATA%/patreg/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("patreg")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/patreg/
    /// - macOS: ~/Library/Application Support/patreg/
    /// - Windows: %APPDATA%/patreg/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("patreg")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidEnv(&'static str, String),
    InvalidSetting(PathBuf, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidEnv(var, value) => {
                write!(f, "Invalid value '{}' for {}", value, var)
            }
            ConfigError::InvalidSetting(path, reason) => {
                write!(f, "Invalid config file '{}': {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    // Env-var tests share process state; keep them from interleaving.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_default_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("patreg.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert!(config.config_file.is_none());
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.sync.claim_lease_secs, 900);
        assert!(config.sync.max_attempts.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/queue.db").unwrap();
        writeln!(file, "remote:").unwrap();
        writeln!(file, "  base_url: https://emr.example.org/openmrs").unwrap();
        writeln!(file, "  username: clerk").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  max_attempts: 5").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/queue.db")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(
            config.remote.base_url.as_deref(),
            Some("https://emr.example.org/openmrs")
        );
        assert_eq!(config.remote.username.as_deref(), Some("clerk"));
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.sync.max_attempts, Some(5));
        assert_eq!(config.sync.interval_secs, 60);
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "database_path: data/queue.db\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/queue.db")
        );
    }

    #[test]
    fn test_env_var_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /from/file.db").unwrap();

        std::env::set_var("PATREG_DATABASE_PATH", "/from/env.db");
        std::env::set_var("PATREG_SERVER_URL", "http://localhost:8080/openmrs");

        let config = Config::load(Some(config_path)).unwrap();

        std::env::remove_var("PATREG_DATABASE_PATH");
        std::env::remove_var("PATREG_SERVER_URL");

        assert_eq!(config.database_path.value, PathBuf::from("/from/env.db"));
        assert_eq!(config.database_path.source, ConfigSource::Environment);
        assert_eq!(
            config.remote.base_url.as_deref(),
            Some("http://localhost:8080/openmrs")
        );
    }

    #[test]
    fn test_invalid_max_attempts_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();

        std::env::set_var("PATREG_MAX_ATTEMPTS", "many");
        let result = Config::load(Some(temp_dir.path().join("none.yaml")));
        std::env::remove_var("PATREG_MAX_ATTEMPTS");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("PATREG_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "sync:\n  max_attempts: 0\n").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting(..)));

        std::env::set_var("PATREG_MAX_ATTEMPTS", "0");
        let result = Config::load(Some(temp_dir.path().join("none.yaml")));
        std::env::remove_var("PATREG_MAX_ATTEMPTS");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidEnv("PATREG_MAX_ATTEMPTS", _)
        ));
    }

    #[test]
    fn test_invalid_yaml_error() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_password_not_serialized() {
        let remote = RemoteConfig {
            password: Some("secret".to_string()),
            ..RemoteConfig::default()
        };
        let json = serde_json::to_string(&remote).unwrap();
        assert!(!json.contains("secret"));
    }
}

//! Configuration file for the shmem CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shmem_core::ConnectionOptions;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Connection defaults
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// `shmem serve` configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connection defaults shared by every subcommand
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Ring capacity per direction in bytes (power of two)
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Maximum message size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Enable LZ4 compression
    #[serde(default)]
    pub compression: bool,
    /// Messages at or above this size are compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Liveness timeout in milliseconds
    #[serde(default = "default_liveness_ms")]
    pub liveness_ms: u64,
    /// How long clients wait for a server, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Segment directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shm_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Echo server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Channels served when `--channel` is not given
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    /// Stop a channel after this many sessions (0 = forever)
    #[serde(default)]
    pub max_sessions: u64,
}

// Default values

fn default_capacity() -> usize {
    shmem_core::DEFAULT_CAPACITY
}

fn default_max_frame_size() -> usize {
    shmem_core::DEFAULT_MAX_FRAME_SIZE
}

fn default_compression_threshold() -> usize {
    shmem_core::DEFAULT_COMPRESSION_THRESHOLD
}

fn default_heartbeat_ms() -> u64 {
    100
}

fn default_liveness_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channels() -> Vec<String> {
    vec!["chan1".to_string()]
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_frame_size: default_max_frame_size(),
            compression: false,
            compression_threshold: default_compression_threshold(),
            heartbeat_ms: default_heartbeat_ms(),
            liveness_ms: default_liveness_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shm_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            max_sessions: 0,
        }
    }
}

impl ConnectionConfig {
    /// Connection options from this section, before environment overrides
    #[must_use]
    pub fn to_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            capacity: self.capacity,
            max_frame_size: self.max_frame_size,
            compression: self.compression,
            compression_threshold: self.compression_threshold,
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            liveness_timeout: Duration::from_millis(self.liveness_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            shm_dir: self.shm_dir.clone(),
            ..ConnectionOptions::default()
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("shmem-connect/config.toml")
    }

    /// Load config from default path, or write the defaults there
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            if let Err(e) = config.save(&path) {
                tracing::debug!("Could not write default config to {}: {}", path.display(), e);
            }
            Ok(config)
        }
    }

    /// Connection options: file values, then `SHMEM_*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if an environment override does not parse.
    pub fn options(&self) -> anyhow::Result<ConnectionOptions> {
        Ok(self
            .connection
            .to_options()
            .apply_env(|key| std::env::var(key).ok())?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.connection.to_options().validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        for channel in &self.server.channels {
            if channel.is_empty() {
                anyhow::bail!("Empty channel name in [server] channels");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.capacity, 4 * 1024 * 1024);
        assert_eq!(config.server.channels, vec!["chan1".to_string()]);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_options_match_library_defaults() {
        let options = Config::default().connection.to_options();
        assert_eq!(options, ConnectionOptions::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.connection.capacity = 1000;
        assert!(config.validate().is_err());

        config.connection.capacity = 4096;
        config.connection.max_frame_size = 1024;
        assert!(config.validate().is_ok());

        config.connection.heartbeat_ms = 5000;
        assert!(config.validate().is_err());

        config.connection.heartbeat_ms = 100;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            capacity = 65536
            compression = true

            [server]
            channels = ["a", "b"]
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.capacity, 65536);
        assert!(config.connection.compression);
        assert_eq!(config.connection.liveness_ms, 2000);
        assert_eq!(config.server.channels.len(), 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.connection.shm_dir = Some(PathBuf::from("/tmp/segments"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}

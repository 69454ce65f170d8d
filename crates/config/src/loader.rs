//! Configuration loader with hot reload support

use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::types::OspreyConfig;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found
    #[error("config file not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),
}

/// Configuration loader with hot reload support
///
/// Herder, dispatcher, vary compare and pipe loop all read the current
/// config through `get()`, so a reload takes effect on the next decision.
pub struct ConfigLoader {
    /// Current configuration (lock-free swappable)
    config: ArcSwap<OspreyConfig>,

    /// Path to config file (for reload)
    config_path: Option<std::path::PathBuf>,
}

impl ConfigLoader {
    /// Create loader with default configuration
    pub fn new() -> Self {
        Self {
            config: ArcSwap::from_pointee(OspreyConfig::default()),
            config_path: None,
        }
    }

    /// Load configuration from file
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let config: OspreyConfig = toml::from_str(&content)?;

        Self::validate(&config)?;

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load configuration from string
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config: OspreyConfig = toml::from_str(content)?;
        Self::validate(&config)?;

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
        })
    }

    /// Get current configuration (lock-free)
    #[inline]
    pub fn get(&self) -> Arc<OspreyConfig> {
        self.config.load_full()
    }

    /// Reload configuration from file
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| ConfigError::Validation("no config file path set".to_string()))?;

        let content = std::fs::read_to_string(path)?;
        let new_config: OspreyConfig = toml::from_str(&content)?;

        Self::validate(&new_config)?;

        // Atomic swap - existing readers continue with old config
        self.config.store(Arc::new(new_config));

        tracing::info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Update configuration programmatically
    pub fn update(&self, new_config: OspreyConfig) -> Result<(), ConfigError> {
        Self::validate(&new_config)?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }

    /// Validate configuration
    fn validate(config: &OspreyConfig) -> Result<(), ConfigError> {
        let w = &config.workers;
        if w.min < 1 {
            return Err(ConfigError::Validation(
                "workers.min must be at least 1".to_string(),
            ));
        }
        if w.min > w.max {
            return Err(ConfigError::Validation(format!(
                "workers.min ({}) exceeds workers.max ({})",
                w.min, w.max
            )));
        }
        if w.pools < 1 {
            return Err(ConfigError::Validation(
                "workers.pools must be at least 1".to_string(),
            ));
        }
        if w.workspace_size < 256 {
            return Err(ConfigError::Validation(
                "workers.workspace_size must be at least 256 bytes".to_string(),
            ));
        }
        if !(config.pipe.timeout_secs > 0.0) {
            return Err(ConfigError::Validation(
                "pipe.timeout_secs must be positive".to_string(),
            ));
        }

        for backend in &config.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::Validation(
                    "backend with empty name".to_string(),
                ));
            }
            if backend.addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' has unparseable address '{}'",
                    backend.name, backend.addr
                )));
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_string() {
        let config_str = r#"
[server]
listen = "127.0.0.1:8080"

[[backends]]
name = "origin"
addr = "127.0.0.1:9000"
"#;

        let loader = ConfigLoader::load_str(config_str).unwrap();
        let config = loader.get();

        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.backends.len(), 1);
    }

    #[test]
    fn test_validation_min_above_max() {
        let config_str = r#"
[workers]
min = 10
max = 2
"#;

        let result = ConfigLoader::load_str(config_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_bad_backend_addr() {
        let config_str = r#"
[[backends]]
name = "origin"
addr = "not-an-address"
"#;

        let result = ConfigLoader::load_str(config_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_hot_reload_update() {
        let loader = ConfigLoader::new();

        let config1 = loader.get();
        assert!(config1.http.gzip_support);

        let mut new_config = (*config1).clone();
        new_config.http.gzip_support = false;
        loader.update(new_config).unwrap();

        let config2 = loader.get();
        assert!(!config2.http.gzip_support);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osprey.toml");
        std::fs::write(
            &path,
            r#"
[workers]
min = 1
max = 4
pools = 1
"#,
        )
        .unwrap();

        let loader = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(loader.get().workers.max, 4);

        // Rewrite and reload
        std::fs::write(
            &path,
            r#"
[workers]
min = 1
max = 6
pools = 1
"#,
        )
        .unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().workers.max, 6);
    }

    #[test]
    fn test_load_file_missing() {
        let result = ConfigLoader::load_file("/nonexistent/osprey.toml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}

//! Configuration system for cellvault

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub paths: PathConfig,
    pub install: InstallConfig,
    pub patches: PatchConfig,
    pub debug: DebugConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Ask before overwriting an installation with the same version
    pub confirm_overwrite: bool,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root of the installed content tree
    pub content_root: PathBuf,
    /// Content catalog document
    pub catalog: PathBuf,
    /// Patch definitions and selections
    pub patches: PathBuf,
    /// Package key database (JSON)
    pub keys: PathBuf,
}

/// Installer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Verify entry checksums after decryption
    pub verify_checksums: bool,
    /// Read buffer size used while extracting entries
    pub buffer_size: usize,
}

/// Patch repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub repositories: Vec<RepositoryConfig>,
    /// HTTP fetch timeout in seconds
    pub fetch_timeout_secs: u64,
}

/// A named patch repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            confirm_overwrite: true,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cellvault");

        Self::with_base(&base)
    }
}

impl PathConfig {
    /// Lay out all paths under one base directory
    pub fn with_base(base: &Path) -> Self {
        Self {
            content_root: base.join("games"),
            catalog: base.join("catalog.json"),
            patches: base.join("patches"),
            keys: base.join("keys.json"),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            buffer_size: 64 * 1024,
        }
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            repositories: vec![RepositoryConfig {
                name: "community".to_string(),
                url: "https://patches.cellvault.dev/xml".to_string(),
            }],
            fetch_timeout_secs: 30,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("cellvault.log"),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, CoreError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), CoreError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cellvault")
            .join("config.toml")
    }

    /// Look up a configured repository by name
    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.patches.repositories.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.confirm_overwrite);
        assert!(config.install.verify_checksums);
        assert_eq!(config.patches.fetch_timeout_secs, 30);
        assert_eq!(config.debug.log_level, LogLevel::Info);
        assert!(config.repository("community").is_some());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.install.buffer_size, config.install.buffer_size);
        assert_eq!(parsed.patches.repositories, config.patches.repositories);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[debug]\nlog_level = \"Trace\"\n").unwrap();
        assert_eq!(parsed.debug.log_level, LogLevel::Trace);
        assert!(parsed.install.verify_checksums);
    }

    #[test]
    fn test_paths_with_base() {
        let paths = PathConfig::with_base(Path::new("/data"));
        assert_eq!(paths.content_root, PathBuf::from("/data/games"));
        assert_eq!(paths.catalog, PathBuf::from("/data/catalog.json"));
    }
}

//! Registry configuration.
//!
//! This module provides the `RegistryConfig` struct describing one project
//! and how its connections are persisted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RegistryError;
use crate::storage::ConfigurationStorage;

/// Default name of the project metadata folder.
pub const DEFAULT_METADATA_FOLDER: &str = ".dbeaver";

/// Configuration of one connection registry.
///
/// # Security
/// No secrets live here. The master password for a file vault and the
/// project encryption key are handed to the registry through
/// [`crate::RegistryServices`].
///
/// # Example
/// ```rust
/// use dsregistry_core::RegistryConfig;
///
/// let config = RegistryConfig::new("/work/project")
///     .with_project_id("analytics")
///     .with_secret_storage(true);
///
/// assert!(config.validate().is_ok());
/// assert!(config.metadata_dir().ends_with(".dbeaver"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Project id, part of every secret key
    pub project_id: String,
    /// Project display name
    pub project_name: String,
    /// Project root directory
    pub project_root: PathBuf,
    /// Metadata folder name under the project root
    pub metadata_folder: String,
    /// Store secrets in the secret controller instead of the credentials file
    pub use_secret_storage: bool,
    /// Encrypt the whole configuration file with the project key
    pub encrypt_project: bool,
    /// Resolve `${VAR}` from the process environment
    pub use_env_variables: bool,
    /// Debounce delay for configuration saves
    pub save_delay: Duration,
    /// Upper bound for disconnecting everything on dispose
    pub shutdown_timeout: Duration,
    /// Upper bound for draining data source users on disconnect
    pub user_drain_timeout: Duration,
    /// Copy the previous file to `{file}.bak` before overwriting
    pub backup_on_save: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            project_id: "General".to_string(),
            project_name: "General".to_string(),
            project_root: PathBuf::from("."),
            metadata_folder: DEFAULT_METADATA_FOLDER.to_string(),
            use_secret_storage: false,
            encrypt_project: false,
            use_env_variables: false,
            save_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            user_drain_timeout: Duration::from_secs(3),
            backup_on_save: true,
        }
    }
}

impl std::fmt::Display for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RegistryConfig({} at {})",
            self.project_id,
            self.project_root.display()
        )
    }
}

impl RegistryConfig {
    /// Creates a configuration for the project at `project_root`.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Default::default()
        }
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid JSON
    pub async fn from_file(path: &Path) -> crate::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RegistryError::io(format!("Reading {}", path.display()), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RegistryError::serialization(format!("Parsing {}", path.display()), e))
    }

    /// Validates configuration values.
    ///
    /// # Errors
    /// Returns error if configuration values are invalid
    pub fn validate(&self) -> crate::Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(RegistryError::configuration("project_id cannot be empty"));
        }
        if self.project_id.contains('/') {
            return Err(RegistryError::configuration(
                "project_id cannot contain '/'",
            ));
        }
        if self.metadata_folder.trim().is_empty() {
            return Err(RegistryError::configuration(
                "metadata_folder cannot be empty",
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(RegistryError::configuration(
                "shutdown_timeout must be greater than 0",
            ));
        }
        if self.save_delay > Duration::from_secs(60) {
            return Err(RegistryError::configuration(
                "save_delay should not exceed 60 seconds",
            ));
        }
        Ok(())
    }

    /// Builder method to set the project id.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Builder method to set the project name.
    pub fn with_project_name(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = project_name.into();
        self
    }

    /// Builder method to choose where secrets go.
    pub const fn with_secret_storage(mut self, enabled: bool) -> Self {
        self.use_secret_storage = enabled;
        self
    }

    /// Builder method to toggle whole-file encryption.
    pub const fn with_encrypt_project(mut self, enabled: bool) -> Self {
        self.encrypt_project = enabled;
        self
    }

    /// Builder method to toggle environment variable substitution.
    pub const fn with_env_variables(mut self, enabled: bool) -> Self {
        self.use_env_variables = enabled;
        self
    }

    /// Builder method to set the save debounce delay.
    pub const fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = delay;
        self
    }

    /// Builder method to set the user drain timeout.
    pub const fn with_user_drain_timeout(mut self, timeout: Duration) -> Self {
        self.user_drain_timeout = timeout;
        self
    }

    /// Project metadata directory.
    pub fn metadata_dir(&self) -> PathBuf {
        self.project_root.join(&self.metadata_folder)
    }

    /// The project's default storage.
    pub fn default_storage(&self) -> ConfigurationStorage {
        ConfigurationStorage::default_modern(&self.metadata_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_default() {
        let config = RegistryConfig::default();
        assert_eq!(config.metadata_folder, ".dbeaver");
        assert_eq!(config.save_delay, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.user_drain_timeout, Duration::from_secs(3));
        assert!(!config.use_secret_storage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_config_validation() {
        assert!(RegistryConfig::default().with_project_id("").validate().is_err());
        assert!(RegistryConfig::default().with_project_id("a/b").validate().is_err());
        let config = RegistryConfig {
            shutdown_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registry_config_paths() {
        let config = RegistryConfig::new("/work/p");
        assert_eq!(config.metadata_dir(), Path::new("/work/p/.dbeaver"));
        assert_eq!(
            config.default_storage().path(),
            Path::new("/work/p/.dbeaver/data-sources.json")
        );
        assert_eq!(config.to_string(), "RegistryConfig(General at /work/p)");
    }

    #[tokio::test]
    async fn test_registry_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, br#"{"project_id": "sales", "use_secret_storage": true}"#)
            .await
            .unwrap();

        let config = RegistryConfig::from_file(&path).await.unwrap();
        assert_eq!(config.project_id, "sales");
        assert!(config.use_secret_storage);
        assert_eq!(config.metadata_folder, ".dbeaver");
    }
}

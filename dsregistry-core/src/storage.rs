//! Configuration storages: the physical files a project keeps its
//! connections in.
//!
//! A project has one default storage (`data-sources.json`) and any number
//! of suffixed ones (`data-sources-team.json`). Projects written by older
//! versions keep connections in XML files at the project root; those are
//! readable but never written.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::Result;
use crate::error::RegistryError;

/// Base name of modern and legacy configuration files.
pub const CONFIG_FILE_PREFIX: &str = "data-sources";
/// Extension of modern configuration files.
pub const MODERN_FILE_EXT: &str = "json";
/// Extension of legacy configuration files.
pub const LEGACY_FILE_EXT: &str = "xml";
/// Base name of the credentials companion file.
pub const CREDENTIALS_FILE_PREFIX: &str = "credentials-config";
/// Older legacy files were hidden.
const LEGACY_HIDDEN_PREFIX: &str = ".dbeaver-data-sources";

/// One configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigurationStorage {
    path: PathBuf,
    storage_id: String,
    suffix: String,
    is_default: bool,
    is_legacy: bool,
}

impl fmt::Display for ConfigurationStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id)
    }
}

impl ConfigurationStorage {
    /// Default modern storage inside `metadata_dir`.
    pub fn default_modern(metadata_dir: &Path) -> Self {
        Self::modern(metadata_dir, "")
    }

    /// Modern storage with the given suffix (empty for the default one).
    pub fn modern(metadata_dir: &Path, suffix: &str) -> Self {
        let storage_id = format!("{}{}.{}", CONFIG_FILE_PREFIX, suffix, MODERN_FILE_EXT);
        Self {
            path: metadata_dir.join(&storage_id),
            storage_id,
            suffix: suffix.to_string(),
            is_default: suffix.is_empty(),
            is_legacy: false,
        }
    }

    /// Recognizes a configuration file by name; returns `None` for
    /// anything else.
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let (stem, ext) = file_name.rsplit_once('.')?;
        let is_legacy = match ext {
            MODERN_FILE_EXT => false,
            LEGACY_FILE_EXT => true,
            _ => return None,
        };
        let suffix = if is_legacy {
            stem.strip_prefix(LEGACY_HIDDEN_PREFIX)
                .or_else(|| stem.strip_prefix(CONFIG_FILE_PREFIX))?
        } else {
            stem.strip_prefix(CONFIG_FILE_PREFIX)?
        };
        if !suffix.is_empty() && !suffix.starts_with('-') {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            storage_id: file_name.to_string(),
            suffix: suffix.to_string(),
            is_default: suffix.is_empty(),
            is_legacy,
        })
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name, used as the storage id.
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    /// Suffix distinguishing non-default storages (e.g. `-team`).
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// True for the project's main storage.
    pub const fn is_default(&self) -> bool {
        self.is_default
    }

    /// True for read-only XML storages.
    pub const fn is_legacy(&self) -> bool {
        self.is_legacy
    }

    /// Path of the credentials companion file of a modern storage.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        if self.is_legacy {
            return None;
        }
        let dir = self.path.parent()?;
        Some(dir.join(format!(
            "{}{}.{}",
            CREDENTIALS_FILE_PREFIX, self.suffix, MODERN_FILE_EXT
        )))
    }

    /// Path of the backup written before overwriting the file.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Modern storage a legacy storage migrates into.
    pub fn modern_counterpart(&self, metadata_dir: &Path) -> Self {
        Self::modern(metadata_dir, &self.suffix)
    }
}

/// Storages found in a project, modern and legacy kept apart.
#[derive(Debug, Clone, Default)]
pub struct StorageScan {
    /// JSON storages in the metadata folder, default first
    pub modern: Vec<ConfigurationStorage>,
    /// XML storages in the project root, default first
    pub legacy: Vec<ConfigurationStorage>,
}

async fn scan_dir(dir: &Path, legacy: bool) -> Result<Vec<ConfigurationStorage>> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(RegistryError::io(format!("Listing {}", dir.display()), e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RegistryError::io(format!("Listing {}", dir.display()), e))?
    {
        if let Some(storage) = ConfigurationStorage::from_path(&entry.path())
            && storage.is_legacy() == legacy
        {
            found.push(storage);
        }
    }
    found.sort_by(|a, b| {
        b.is_default()
            .cmp(&a.is_default())
            .then_with(|| a.storage_id().cmp(b.storage_id()))
    });
    Ok(found)
}

/// Finds the configuration files of a project.
///
/// # Errors
/// Returns error if a directory exists but cannot be listed
pub async fn scan_storages(project_root: &Path, metadata_dir: &Path) -> Result<StorageScan> {
    let modern = scan_dir(metadata_dir, false).await?;
    let legacy = scan_dir(project_root, true).await?;
    debug!(
        modern = modern.len(),
        legacy = legacy.len(),
        root = %project_root.display(),
        "Scanned configuration storages"
    );
    Ok(StorageScan { modern, legacy })
}

/// Reads a file, mapping a missing file to `None`.
///
/// # Errors
/// Returns error for any failure other than "not found"
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RegistryError::io(format!("Reading {}", path.display()), e)),
    }
}

/// Deletes a file if it exists.
///
/// # Errors
/// Returns error for any failure other than "not found"
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RegistryError::io(format!("Deleting {}", path.display()), e)),
    }
}

/// Writes a file through a temporary sibling and a rename.
///
/// # Errors
/// Returns error if the directory cannot be created or the write fails
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| RegistryError::io(format!("Creating {}", dir.display()), e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| RegistryError::io(format!("Writing {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RegistryError::io(format!("Replacing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modern_storage_paths() {
        let dir = Path::new("/p/.dbeaver");
        let storage = ConfigurationStorage::default_modern(dir);
        assert_eq!(storage.storage_id(), "data-sources.json");
        assert!(storage.is_default());
        assert_eq!(
            storage.credentials_path().unwrap(),
            Path::new("/p/.dbeaver/credentials-config.json")
        );
        assert_eq!(storage.backup_path(), Path::new("/p/.dbeaver/data-sources.json.bak"));

        let team = ConfigurationStorage::modern(dir, "-team");
        assert!(!team.is_default());
        assert_eq!(
            team.credentials_path().unwrap(),
            Path::new("/p/.dbeaver/credentials-config-team.json")
        );
    }

    #[test]
    fn test_from_path_recognizes_files() {
        let legacy = ConfigurationStorage::from_path(Path::new("/p/.dbeaver-data-sources.xml")).unwrap();
        assert!(legacy.is_legacy());
        assert!(legacy.is_default());
        assert!(legacy.credentials_path().is_none());

        let legacy = ConfigurationStorage::from_path(Path::new("/p/data-sources-2.xml")).unwrap();
        assert_eq!(legacy.suffix(), "-2");
        assert_eq!(
            legacy.modern_counterpart(Path::new("/p/.dbeaver")).storage_id(),
            "data-sources-2.json"
        );

        assert!(ConfigurationStorage::from_path(Path::new("/p/data-sourcesX.json")).is_none());
        assert!(ConfigurationStorage::from_path(Path::new("/p/credentials-config.json")).is_none());
        assert!(ConfigurationStorage::from_path(Path::new("/p/data-sources.json.bak")).is_none());
    }

    #[tokio::test]
    async fn test_scan_storages_orders_default_first() {
        let root = tempfile::tempdir().unwrap();
        let meta = root.path().join(".dbeaver");
        tokio::fs::create_dir_all(&meta).await.unwrap();
        for name in ["data-sources-b.json", "data-sources.json", "credentials-config.json"] {
            tokio::fs::write(meta.join(name), b"{}").await.unwrap();
        }
        tokio::fs::write(root.path().join("data-sources.xml"), b"<data-sources/>")
            .await
            .unwrap();

        let scan = scan_storages(root.path(), &meta).await.unwrap();
        let ids: Vec<_> = scan.modern.iter().map(ConfigurationStorage::storage_id).collect();
        assert_eq!(ids, ["data-sources.json", "data-sources-b.json"]);
        assert_eq!(scan.legacy.len(), 1);
    }

    #[tokio::test]
    async fn test_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");

        assert!(read_optional(&path).await.unwrap().is_none());
        write_atomic(&path, b"{}").await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap().unwrap(), b"{}");
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!remove_if_exists(&path).await.unwrap());
    }
}

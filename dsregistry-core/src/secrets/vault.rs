//! Secret controller backed by an encrypted vault file.
//!
//! The vault is a JSON-encoded [`EncryptedData`] envelope whose plaintext is
//! a `{key: value}` map. The key is derived once from the master password
//! with the Argon2id parameters stored in the envelope; every flush seals
//! the map again under a fresh nonce.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::SecretController;
use crate::Result;
use crate::error::RegistryError;
use crate::security::encryption::{EncryptedData, KdfParams, ValueEncryptor};
use crate::storage::{read_optional, write_atomic};

/// File-backed secret store.
pub struct FileSecretController {
    path: PathBuf,
    encryptor: ValueEncryptor,
    kdf_params: KdfParams,
    values: Mutex<BTreeMap<String, String>>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for FileSecretController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSecretController")
            .field("path", &self.path)
            .field("keys", &self.values.lock().len())
            .finish_non_exhaustive()
    }
}

async fn derive_encryptor(master_password: &str, kdf_params: &KdfParams) -> Result<ValueEncryptor> {
    let password = Zeroizing::new(master_password.to_string());
    let params = kdf_params.clone();
    tokio::task::spawn_blocking(move || ValueEncryptor::from_password(&password, &params))
        .await
        .map_err(|e| RegistryError::encryption(format!("Key derivation task failed: {}", e)))?
}

impl FileSecretController {
    /// Opens the vault at `path`, creating an empty one in memory if the
    /// file does not exist yet (it is written on the first flush).
    ///
    /// # Errors
    /// Returns error if the file is unreadable or the password is wrong
    pub async fn open(path: impl Into<PathBuf>, master_password: &str) -> Result<Self> {
        let path = path.into();
        let Some(bytes) = read_optional(&path).await? else {
            let kdf_params = KdfParams::new();
            let encryptor = derive_encryptor(master_password, &kdf_params).await?;
            info!(path = %path.display(), "Creating new secret vault");
            return Ok(Self {
                path,
                encryptor,
                kdf_params,
                values: Mutex::new(BTreeMap::new()),
                dirty: AtomicBool::new(false),
            });
        };

        let envelope: EncryptedData = serde_json::from_slice(&bytes).map_err(|e| {
            RegistryError::serialization(format!("Reading vault {}", path.display()), e)
        })?;
        let encryptor = derive_encryptor(master_password, &envelope.kdf_params).await?;
        let plaintext = Zeroizing::new(encryptor.open(&envelope).map_err(|_| {
            RegistryError::secret_storage("Cannot open secret vault: wrong master password or corrupted file")
        })?);
        let values: BTreeMap<String, String> = serde_json::from_slice(&plaintext)
            .map_err(|e| RegistryError::serialization("Decoding vault contents", e))?;
        debug!(path = %path.display(), keys = values.len(), "Opened secret vault");

        Ok(Self {
            path,
            encryptor,
            kdf_params: envelope.kdf_params,
            values: Mutex::new(values),
            dirty: AtomicBool::new(false),
        })
    }

    /// Vault file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecretController for FileSecretController {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Option<String>) -> Result<()> {
        let changed = {
            let mut values = self.values.lock();
            match value {
                Some(value) => values.insert(key.to_string(), value.clone()) != Some(value),
                None => values.remove(key).is_some(),
            }
        };
        if changed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let prefix = format!("{}/", key);
        let removed = {
            let mut values = self.values.lock();
            let before = values.len();
            values.retain(|k, _| k != key && !k.starts_with(&prefix));
            before != values.len()
        };
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let plaintext = {
            let values = self.values.lock();
            Zeroizing::new(
                serde_json::to_vec(&*values)
                    .map_err(|e| RegistryError::serialization("Encoding vault contents", e))?,
            )
        };
        let envelope = self.encryptor.seal(&plaintext, &self.kdf_params)?;
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| RegistryError::serialization("Encoding vault envelope", e))?;
        if let Err(e) = write_atomic(&self.path, &bytes).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| RegistryError::io(format!("Restricting {}", self.path.display()), e))?;
        }
        debug!(path = %self.path.display(), "Flushed secret vault");
        Ok(())
    }
}

//! Secure credential storage.
//!
//! Secrets never go into the plaintext configuration file. When secret
//! storage is enabled each data source's credentials live in a
//! [`SecretController`] under a key derived from the project and the data
//! source id; otherwise they go to the (encrypted) credentials file next to
//! the configuration.
//!
//! # Key layout
//! - `datasources/{project}/{id}`: connection credentials
//! - `datasources/{project}/{id}/network/{handler}`: handler credentials
//! - `network-profiles/{project}/{profile}/network/{handler}`
//! - `auth-profiles/{project}/{profile}`
//!
//! Each key holds a JSON [`SecretRecord`].

mod memory;
mod vault;

pub use memory::MemorySecretController;
pub use vault::FileSecretController;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::Result;
use crate::error::RegistryError;

/// Async key/value store for secrets.
///
/// # Object Safety
/// This trait is object-safe and shared as `Arc<dyn SecretController>`.
#[async_trait]
pub trait SecretController: Send + Sync {
    /// Reads a value.
    ///
    /// # Errors
    /// Returns error if the store is locked or unreadable
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a value; `None` deletes it.
    ///
    /// # Errors
    /// Returns error if the store rejects the write
    async fn set(&self, key: &str, value: Option<String>) -> Result<()>;

    /// Deletes a key and every key below it (`{key}/...`).
    ///
    /// # Errors
    /// Returns error if the store rejects the delete
    async fn delete(&self, key: &str) -> Result<()>;

    /// Persists pending writes.
    ///
    /// # Errors
    /// Returns error if persisting fails
    async fn flush(&self) -> Result<()>;

    /// False when the store cannot currently be used (e.g. locked).
    fn is_available(&self) -> bool {
        true
    }
}

/// Secret values stored under one key.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// User name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Other secret properties
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("user", &self.user)
            .field("has_password", &self.password.is_some())
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretRecord {
    /// True if nothing would be stored.
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.password.is_none() && self.properties.is_empty()
    }

    /// Encodes the record as stored in a controller.
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RegistryError::serialization("Encoding secret record", e))
    }

    /// Decodes a stored record.
    ///
    /// # Errors
    /// Returns error if the value is not a record
    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| RegistryError::serialization("Decoding secret record", e))
    }
}

/// Key of a data source's connection credentials.
pub fn data_source_key(project_id: &str, data_source_id: &str) -> String {
    format!("datasources/{}/{}", project_id, data_source_id)
}

/// Key of a network handler's credentials within a data source.
pub fn data_source_handler_key(project_id: &str, data_source_id: &str, handler_id: &str) -> String {
    format!(
        "{}/network/{}",
        data_source_key(project_id, data_source_id),
        handler_id
    )
}

/// Key of a network handler's credentials within a network profile.
pub fn network_profile_handler_key(project_id: &str, profile: &str, handler_id: &str) -> String {
    format!("network-profiles/{}/{}/network/{}", project_id, profile, handler_id)
}

/// Key of an auth profile's credentials.
pub fn auth_profile_key(project_id: &str, profile_id: &str) -> String {
    format!("auth-profiles/{}/{}", project_id, profile_id)
}

/// Reads a record, falling back to the older per-field layout
/// (`{key}/user`, `{key}/password`).
///
/// # Errors
/// Returns error if the controller fails
pub async fn read_record(controller: &dyn SecretController, key: &str) -> Result<Option<SecretRecord>> {
    if let Some(value) = controller.get(key).await? {
        return SecretRecord::from_json(&value).map(Some);
    }
    let user = controller.get(&format!("{}/user", key)).await?;
    let password = controller.get(&format!("{}/password", key)).await?;
    if user.is_none() && password.is_none() {
        return Ok(None);
    }
    Ok(Some(SecretRecord {
        user,
        password,
        properties: BTreeMap::new(),
    }))
}

/// Writes a record; an empty record deletes the key.
///
/// # Errors
/// Returns error if the controller fails
pub async fn write_record(
    controller: &dyn SecretController,
    key: &str,
    record: &SecretRecord,
) -> Result<()> {
    if record.is_empty() {
        controller.set(key, None).await
    } else {
        controller.set(key, Some(record.to_json()?)).await
    }
}

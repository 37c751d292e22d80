//! Configuration file serializers.
//!
//! Serializers are pure: they turn file bytes into a [`ParsedConfiguration`]
//! and a [`SaveData`] snapshot back into bytes. Reading and writing files,
//! reconciling with live descriptors and talking to the secret controller
//! is the registry's job.
//!
//! # Module Structure
//! - `modern`: JSON `data-sources*.json` with a parallel secrets map
//! - `legacy`: read-only XML `data-sources*.xml`
//! - `json`: typed accessors over `serde_json` maps

mod json;
mod legacy;
mod modern;

pub use legacy::LegacySerializer;
pub use modern::{DataSourceSecrets, ModernSerializer};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;
use crate::model::{
    AuthProfile, ConnectionType, DataSourceFolder, DataSourceOrigin, DataSourceSettings,
    DriverDescriptor, NetworkProfile, ObjectFilter, VirtualModel,
};
use crate::network::NetworkHandlerRegistry;
use crate::provider::DriverRegistry;
use crate::security::encryption::ValueEncryptor;
use crate::storage::ConfigurationStorage;

/// Where secret values are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsMode {
    /// In the secret controller, keyed per data source
    Controller,
    /// In the credentials file next to the configuration
    CredentialsFile,
}

/// Collaborators available while parsing.
#[derive(Clone, Copy)]
pub struct ParseContext<'a> {
    /// Driver table; custom drivers found in the file are registered here
    pub drivers: &'a DriverRegistry,
    /// Known network handlers; unknown handler ids are dropped
    pub network_handlers: &'a NetworkHandlerRegistry,
    /// Project key for encrypted files
    pub encryptor: Option<&'a ValueEncryptor>,
    /// Raw credentials file of the storage, when present
    pub credentials: Option<&'a [u8]>,
    /// Active secrets mode
    pub secrets_mode: SecretsMode,
}

/// One data source read from a file.
#[derive(Debug, Clone)]
pub struct ParsedDataSource {
    /// Data source id
    pub id: String,
    /// Provenance
    pub origin: DataSourceOrigin,
    /// Persisted settings
    pub settings: DataSourceSettings,
    /// Attached virtual model
    pub virtual_model: Option<VirtualModel>,
    /// Secrets were read together with the file (credentials file or
    /// legacy attributes) and need no controller lookup
    pub secrets_resolved: bool,
    /// The file carried a plaintext user or password that overrides the
    /// secure values
    pub plaintext_credentials: bool,
}

/// Everything read from one configuration file.
#[derive(Debug, Clone, Default)]
pub struct ParsedConfiguration {
    /// Folders in file order
    pub folders: Vec<DataSourceFolder>,
    /// Data sources in file order
    pub data_sources: Vec<ParsedDataSource>,
    /// Network profiles
    pub network_profiles: Vec<NetworkProfile>,
    /// Auth profiles
    pub auth_profiles: Vec<AuthProfile>,
    /// Global saved filters
    pub saved_filters: Vec<ObjectFilter>,
    /// Connection types declared in the file
    pub connection_types: Vec<ConnectionType>,
    /// Opaque external configurations by id
    pub external_configurations: BTreeMap<String, serde_json::Value>,
    /// Profile secrets were read from the credentials file
    pub profile_secrets_resolved: bool,
}

/// Data source state captured for saving.
#[derive(Debug, Clone)]
pub struct DataSourceSnapshot {
    /// Data source id
    pub id: String,
    /// Provenance
    pub origin: DataSourceOrigin,
    /// Persisted settings
    pub settings: DataSourceSettings,
    /// Attached virtual model
    pub virtual_model: Option<VirtualModel>,
    /// Write this data source's secrets (resolved or never saved before)
    pub persist_secrets: bool,
}

/// Input of a save.
#[derive(Debug, Clone, Copy)]
pub struct SaveData<'a> {
    /// Project id, part of secret keys
    pub project_id: &'a str,
    /// Data sources of the storage being written
    pub data_sources: &'a [DataSourceSnapshot],
    /// All folders
    pub folders: &'a [DataSourceFolder],
    /// Network profiles
    pub network_profiles: &'a [NetworkProfile],
    /// Auth profiles
    pub auth_profiles: &'a [AuthProfile],
    /// Saved filters
    pub saved_filters: &'a [ObjectFilter],
    /// Connection types to persist
    pub connection_types: &'a [ConnectionType],
    /// User-defined drivers
    pub custom_drivers: &'a [Arc<DriverDescriptor>],
    /// External configurations
    pub external_configurations: &'a BTreeMap<String, serde_json::Value>,
    /// Where secrets go
    pub secrets_mode: SecretsMode,
    /// Project key
    pub encryptor: Option<&'a ValueEncryptor>,
    /// Encrypt the configuration file itself
    pub encrypt_project: bool,
    /// Current credentials file; entries of data sources whose secrets
    /// are not persisted are carried over from it
    pub previous_credentials: Option<&'a [u8]>,
}

/// One secret controller write produced by a save.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretUpdate {
    /// Secret key
    pub key: String,
    /// Encoded record; `None` deletes the key
    pub value: Option<String>,
}

impl std::fmt::Debug for SecretUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretUpdate")
            .field("key", &self.key)
            .field("delete", &self.value.is_none())
            .finish()
    }
}

/// Output of a save.
#[derive(Debug, Clone, Default)]
pub struct SavedConfiguration {
    /// Configuration file contents
    pub config: Vec<u8>,
    /// Credentials file contents; `None` means the file must be removed
    pub credentials: Option<Vec<u8>>,
    /// The previous credentials file could not be read and holds secrets
    /// this save cannot reproduce; leave it untouched
    pub keep_credentials: bool,
    /// Secret controller writes
    pub secrets: Vec<SecretUpdate>,
}

/// Reads and writes one configuration file format.
pub trait DataSourceSerializer: Send + Sync {
    /// Parses a configuration file.
    ///
    /// Individual bad entries are logged and skipped; only an unreadable
    /// file as a whole is an error.
    ///
    /// # Errors
    /// Returns error if the file cannot be decoded at all
    fn parse_data_sources(
        &self,
        storage: &ConfigurationStorage,
        content: &[u8],
        ctx: &ParseContext<'_>,
    ) -> Result<ParsedConfiguration>;

    /// Serializes a storage.
    ///
    /// # Errors
    /// Returns error if the format is read-only or encoding fails
    fn save_data_sources(
        &self,
        storage: &ConfigurationStorage,
        data: &SaveData<'_>,
    ) -> Result<SavedConfiguration>;
}

/// Serializer for a storage's format.
pub fn serializer_for(storage: &ConfigurationStorage) -> Box<dyn DataSourceSerializer> {
    if storage.is_legacy() {
        Box::new(LegacySerializer)
    } else {
        Box::new(ModernSerializer)
    }
}

//! Persisted settings of one data source.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::connection::ConnectionConfiguration;
use super::driver::DriverDescriptor;
use super::filter::ObjectFilter;
use super::navigator::NavigatorSettings;
use crate::error::RegistryError;

/// Provenance of a data source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataSourceOrigin {
    /// Defined in the project's own configuration
    #[default]
    Local,
    /// Supplied by an external system (cloud catalog, team server)
    External {
        /// Id of the registered origin implementation
        kind: String,
        /// Origin-specific attributes, persisted as-is
        properties: BTreeMap<String, String>,
    },
}

impl DataSourceOrigin {
    /// Shorthand for an external origin without attributes.
    pub fn external(kind: impl Into<String>) -> Self {
        Self::External {
            kind: kind.into(),
            properties: BTreeMap::new(),
        }
    }

    /// True for locally defined data sources.
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

/// Operations that can be restricted for a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataSourcePermission {
    /// Editing table data
    EditData,
    /// Changing metadata (DDL)
    EditMetadata,
    /// Running scripts
    ExecuteScripts,
    /// Importing data
    ImportData,
}

impl DataSourcePermission {
    /// All permissions.
    pub const ALL: [Self; 4] = [
        Self::EditData,
        Self::EditMetadata,
        Self::ExecuteScripts,
        Self::ImportData,
    ];

    /// Persisted name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EditData => "edit-data",
            Self::EditMetadata => "edit-meta",
            Self::ExecuteScripts => "execute-scripts",
            Self::ImportData => "import-data",
        }
    }
}

impl FromStr for DataSourcePermission {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| RegistryError::configuration(format!("Unknown permission '{}'", s)))
    }
}

/// User metadata overlay (virtual keys, references, colorings).
///
/// The registry does not interpret the content; it only keeps it attached
/// to the right data source and round-trips it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualModel {
    /// Model id; equals the data source id unless shared
    pub id: String,
    /// Opaque model content
    pub content: serde_json::Value,
}

impl VirtualModel {
    /// Creates a model.
    pub fn new(id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            content,
        }
    }

    /// Models with no content are not written.
    pub fn has_valuable_data(&self) -> bool {
        match &self.content {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }
}

/// Settings persisted for a data source. Two descriptors are
/// settings-equal when their `DataSourceSettings` are equal.
#[derive(Clone, PartialEq, Eq)]
pub struct DataSourceSettings {
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Driver (possibly a placeholder)
    pub driver: Arc<DriverDescriptor>,
    /// Persist credentials
    pub save_password: bool,
    /// Open connections read-only
    pub read_only: bool,
    /// Navigator display settings
    pub navigator: NavigatorSettings,
    /// Folder path
    pub folder: Option<String>,
    /// Hash of the lock password protecting the settings
    pub lock_password_hash: Option<String>,
    /// Connection configuration
    pub connection: ConnectionConfiguration,
    /// Navigator object filters
    pub filters: Vec<ObjectFilter>,
    /// Custom preferences
    pub preferences: BTreeMap<String, String>,
    /// Restricted operations
    pub permission_restrictions: BTreeSet<DataSourcePermission>,
}

impl fmt::Debug for DataSourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceSettings")
            .field("name", &self.name)
            .field("driver", &self.driver.full_id())
            .field("save_password", &self.save_password)
            .field("read_only", &self.read_only)
            .field("folder", &self.folder)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl DataSourceSettings {
    /// Creates settings for a new data source.
    pub fn new(
        name: impl Into<String>,
        driver: Arc<DriverDescriptor>,
        connection: ConnectionConfiguration,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            driver,
            save_password: true,
            read_only: false,
            navigator: NavigatorSettings::default(),
            folder: None,
            lock_password_hash: None,
            connection,
            filters: Vec::new(),
            preferences: BTreeMap::new(),
            permission_restrictions: BTreeSet::new(),
        }
    }

    /// Builder method to place the data source in a folder.
    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder method to control credential persistence.
    pub const fn with_save_password(mut self, save_password: bool) -> Self {
        self.save_password = save_password;
        self
    }

    /// Filter registered for an object kind, if any.
    pub fn object_filter(&self, object_type: &str) -> Option<&ObjectFilter> {
        self.filters
            .iter()
            .find(|f| f.object_type.as_deref() == Some(object_type))
    }

    /// Replaces the filter for the same object kind, or appends it.
    pub fn update_object_filter(&mut self, filter: ObjectFilter) {
        match self
            .filters
            .iter_mut()
            .find(|f| f.object_type == filter.object_type && f.id == filter.id)
        {
            Some(existing) => *existing = filter,
            None => self.filters.push(filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> DataSourceSettings {
        DataSourceSettings::new(
            "Orders",
            Arc::new(DriverDescriptor::new("postgresql", "postgres-jdbc", "PostgreSQL")),
            ConnectionConfiguration::new("db"),
        )
    }

    #[test]
    fn test_settings_equality_tracks_connection() {
        let a = settings();
        let mut b = settings();
        assert_eq!(a, b);
        b.connection.database_name = Some("orders".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn test_update_object_filter() {
        let mut s = settings();
        s.update_object_filter(ObjectFilter::new("schema").including(["a"]));
        s.update_object_filter(ObjectFilter::new("schema").including(["b"]));
        assert_eq!(s.filters.len(), 1);
        assert_eq!(s.object_filter("schema").unwrap().include, vec!["b"]);
    }

    #[test]
    fn test_permission_names() {
        for permission in DataSourcePermission::ALL {
            assert_eq!(
                permission.as_str().parse::<DataSourcePermission>().unwrap(),
                permission
            );
        }
    }

    #[test]
    fn test_virtual_model_valuable_data() {
        assert!(!VirtualModel::new("m", json!({})).has_valuable_data());
        assert!(VirtualModel::new("m", json!({"entities": {"t": {}}})).has_valuable_data());
    }
}

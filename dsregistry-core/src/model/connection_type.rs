//! Connection types: named policy bundles referenced by id from
//! connection configurations.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::warn;

/// Named policy bundle (auto-commit, confirmations, idle-close timers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionType {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Display color as `r,g,b` or a named color
    pub color: String,
    /// Free-form description
    pub description: Option<String>,
    /// Auto-commit by default
    pub auto_commit: bool,
    /// Ask before executing queries
    pub confirm_execute: bool,
    /// Ask before saving data changes
    pub confirm_data_change: bool,
    /// End idle transactions automatically
    pub auto_close_transactions: bool,
    /// Idle transaction period in seconds
    pub close_transactions_period: u32,
    /// Close idle connections automatically
    pub auto_close_connections: bool,
    /// Idle connection period in seconds
    pub close_connections_period: u32,
    /// Shipped with the registry; only persisted when modified
    pub predefined: bool,
}

impl ConnectionType {
    /// Creates a custom type with development-style defaults.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: "255,255,255".to_string(),
            description: None,
            auto_commit: true,
            confirm_execute: false,
            confirm_data_change: false,
            auto_close_transactions: false,
            close_transactions_period: 1800,
            auto_close_connections: false,
            close_connections_period: 1800,
            predefined: false,
        }
    }

    /// Development connections.
    pub fn dev() -> Self {
        Self {
            description: Some("Regular development database".to_string()),
            predefined: true,
            ..Self::new("dev", "Development")
        }
    }

    /// Test connections.
    pub fn test() -> Self {
        Self {
            color: "196,255,181".to_string(),
            description: Some("Test (QA) database".to_string()),
            predefined: true,
            ..Self::new("test", "Test")
        }
    }

    /// Production connections.
    pub fn prod() -> Self {
        Self {
            color: "247,159,129".to_string(),
            description: Some("Production database".to_string()),
            auto_commit: false,
            confirm_execute: true,
            confirm_data_change: true,
            auto_close_transactions: true,
            predefined: true,
            ..Self::new("prod", "Production")
        }
    }

    /// Id of the fallback type.
    pub const DEFAULT_ID: &'static str = "dev";
}

/// Process-wide table of known connection types.
#[derive(Debug)]
pub struct ConnectionTypeRegistry {
    types: RwLock<BTreeMap<String, ConnectionType>>,
}

impl Default for ConnectionTypeRegistry {
    fn default() -> Self {
        let registry = Self {
            types: RwLock::new(BTreeMap::new()),
        };
        for predefined in [ConnectionType::dev(), ConnectionType::test(), ConnectionType::prod()] {
            registry.update_connection_type(predefined);
        }
        registry
    }
}

impl ConnectionTypeRegistry {
    /// Creates a registry holding the predefined types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a type up; unknown ids fall back to the default type.
    pub fn connection_type(&self, id: Option<&str>) -> ConnectionType {
        let types = self.types.read();
        if let Some(id) = id {
            if let Some(found) = types.get(id) {
                return found.clone();
            }
            warn!(connection_type = id, "Connection type not found, using default");
        }
        types
            .get(ConnectionType::DEFAULT_ID)
            .cloned()
            .unwrap_or_else(ConnectionType::dev)
    }

    /// Looks a type up without fallback.
    pub fn find(&self, id: &str) -> Option<ConnectionType> {
        self.types.read().get(id).cloned()
    }

    /// Adds a type. A duplicate id is reported and replaced.
    pub fn add_connection_type(&self, connection_type: ConnectionType) {
        let mut types = self.types.write();
        if types.contains_key(&connection_type.id) {
            warn!(
                connection_type = connection_type.id.as_str(),
                "Duplicate connection type id, replacing"
            );
        }
        types.insert(connection_type.id.clone(), connection_type);
    }

    /// Inserts or silently replaces a type (used when loading files).
    pub fn update_connection_type(&self, connection_type: ConnectionType) {
        self.types
            .write()
            .insert(connection_type.id.clone(), connection_type);
    }

    /// Removes a custom type; predefined types are kept.
    pub fn remove_connection_type(&self, id: &str) -> bool {
        let mut types = self.types.write();
        match types.get(id) {
            Some(existing) if !existing.predefined => types.remove(id).is_some(),
            _ => false,
        }
    }

    /// All types sorted by id.
    pub fn connection_types(&self) -> Vec<ConnectionType> {
        self.types.read().values().cloned().collect()
    }

    /// Types that must be written to configuration: custom ones and
    /// predefined ones whose settings were changed.
    pub fn persistable_types(&self) -> Vec<ConnectionType> {
        let pristine = [ConnectionType::dev(), ConnectionType::test(), ConnectionType::prod()];
        self.types
            .read()
            .values()
            .filter(|t| !t.predefined || !pristine.contains(t))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_types_present() {
        let registry = ConnectionTypeRegistry::new();
        let ids: Vec<String> = registry.connection_types().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["dev", "prod", "test"]);
        assert!(registry.persistable_types().is_empty());
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        let registry = ConnectionTypeRegistry::new();
        assert_eq!(registry.connection_type(Some("staging")).id, "dev");
        assert_eq!(registry.connection_type(None).id, "dev");
        assert_eq!(registry.connection_type(Some("prod")).id, "prod");
    }

    #[test]
    fn test_modified_predefined_type_is_persistable() {
        let registry = ConnectionTypeRegistry::new();
        let mut prod = registry.connection_type(Some("prod"));
        prod.confirm_execute = false;
        registry.update_connection_type(prod);
        registry.add_connection_type(ConnectionType::new("staging", "Staging"));

        let ids: Vec<String> = registry.persistable_types().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["prod", "staging"]);
    }

    #[test]
    fn test_predefined_types_cannot_be_removed() {
        let registry = ConnectionTypeRegistry::new();
        registry.add_connection_type(ConnectionType::new("staging", "Staging"));
        assert!(!registry.remove_connection_type("prod"));
        assert!(registry.remove_connection_type("staging"));
    }
}

//! Reusable network and authentication profiles.

use std::collections::BTreeMap;
use std::fmt;

use super::connection::ConnectionConfiguration;
use super::handler::NetworkHandlerConfiguration;

/// Named set of network handlers shared between connections.
///
/// A connection selects a profile through `config_profile`; the profile's
/// enabled handlers are merged into the resolved configuration at connect
/// time unless the connection defines a handler with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkProfile {
    /// Unique profile name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Profile-level properties
    pub properties: BTreeMap<String, String>,
    /// Handler configurations
    pub handlers: Vec<NetworkHandlerConfiguration>,
}

impl NetworkProfile {
    /// Creates an empty profile.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Merges enabled profile handlers into `config`. Handlers the
    /// connection already declares take precedence.
    pub fn apply_to(&self, config: &mut ConnectionConfiguration) {
        for handler in self.handlers.iter().filter(|h| h.enabled) {
            if config.handler(&handler.id).is_none() {
                config.handlers.push(handler.clone());
            }
        }
    }
}

/// Named credential set shared between connections.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct AuthProfile {
    /// Unique profile id
    pub id: String,
    /// Display name
    pub name: String,
    /// Authentication model id
    pub auth_model: Option<String>,
    /// Persist the password
    pub save_password: bool,
    /// User name
    pub user_name: Option<String>,
    /// Password (secret)
    pub user_password: Option<String>,
    /// Non-secret auth properties
    pub properties: BTreeMap<String, String>,
}

impl fmt::Debug for AuthProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("auth_model", &self.auth_model)
            .field("save_password", &self.save_password)
            .field("user_name", &self.user_name)
            .field("has_password", &self.user_password.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthProfile {
    /// Creates an empty profile.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Overrides the connection's credentials and auth model.
    pub fn apply_to(&self, config: &mut ConnectionConfiguration) {
        if self.auth_model.is_some() {
            config.auth_model.clone_from(&self.auth_model);
        }
        if self.user_name.is_some() {
            config.user_name.clone_from(&self.user_name);
        }
        if self.user_password.is_some() {
            config.user_password.clone_from(&self.user_password);
        }
        for (name, value) in &self.properties {
            config.auth_properties.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkHandlerType;

    #[test]
    fn test_network_profile_does_not_override_local_handlers() {
        let mut profile = NetworkProfile::new("bastion");
        profile.handlers.push(
            NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel)
                .with_property("host", "profile-host"),
        );
        let mut disabled = NetworkHandlerConfiguration::new("socks_proxy", NetworkHandlerType::Proxy);
        disabled.enabled = false;
        profile.handlers.push(disabled);

        let mut config = ConnectionConfiguration::new("db").with_handler(
            NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel)
                .with_property("host", "local-host"),
        );
        profile.apply_to(&mut config);

        assert_eq!(config.handlers.len(), 1);
        assert_eq!(
            config.handlers[0].properties.get("host").map(String::as_str),
            Some("local-host")
        );
    }

    #[test]
    fn test_auth_profile_overrides_credentials() {
        let mut profile = AuthProfile::new("ldap", "Corporate LDAP");
        profile.user_name = Some("svc".to_string());
        profile.user_password = Some("pw".to_string());

        let mut config = ConnectionConfiguration::new("db").with_credentials("local", None);
        profile.apply_to(&mut config);

        assert_eq!(config.user_name.as_deref(), Some("svc"));
        assert_eq!(config.user_password.as_deref(), Some("pw"));
        assert!(!format!("{:?}", profile).contains("\"pw\""));
    }
}

//! Network handler configuration (tunnels, proxies, config handlers).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;

/// Kind of network handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkHandlerType {
    /// Rewrites the target address through a tunnel (SSH)
    Tunnel,
    /// Routes the socket through a proxy
    Proxy,
    /// Contributes driver configuration only (SSL and the like)
    Config,
}

impl NetworkHandlerType {
    /// Persisted name of the handler type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tunnel => "TUNNEL",
            Self::Proxy => "PROXY",
            Self::Config => "CONFIG",
        }
    }
}

impl fmt::Display for NetworkHandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkHandlerType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TUNNEL" => Ok(Self::Tunnel),
            "PROXY" => Ok(Self::Proxy),
            "CONFIG" => Ok(Self::Config),
            other => Err(RegistryError::configuration(format!(
                "Unknown network handler type '{}'",
                other
            ))),
        }
    }
}

/// Configuration of one network handler attached to a connection or a
/// network profile.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkHandlerConfiguration {
    /// Handler id (e.g. `ssh_tunnel`)
    pub id: String,
    /// Handler kind
    pub handler_type: NetworkHandlerType,
    /// Disabled handlers are kept in memory but not persisted
    pub enabled: bool,
    /// Persist the handler's credentials
    pub save_password: bool,
    /// Handler user name
    pub user_name: Option<String>,
    /// Handler password (secret)
    pub password: Option<String>,
    /// Plain handler properties
    pub properties: BTreeMap<String, String>,
    /// Secret handler properties (key passphrases)
    pub secure_properties: BTreeMap<String, String>,
}

impl fmt::Debug for NetworkHandlerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkHandlerConfiguration")
            .field("id", &self.id)
            .field("handler_type", &self.handler_type)
            .field("enabled", &self.enabled)
            .field("save_password", &self.save_password)
            .field("user_name", &self.user_name)
            .field("has_password", &self.password.is_some())
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl NetworkHandlerConfiguration {
    /// Creates an enabled handler configuration.
    pub fn new(id: impl Into<String>, handler_type: NetworkHandlerType) -> Self {
        Self {
            id: id.into(),
            handler_type,
            enabled: true,
            save_password: false,
            user_name: None,
            password: None,
            properties: BTreeMap::new(),
            secure_properties: BTreeMap::new(),
        }
    }

    /// Builder method to set a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// True if a password or secure property is held.
    pub fn has_secrets(&self) -> bool {
        self.password.is_some() || !self.secure_properties.is_empty()
    }

    /// Drops the password and secure properties.
    pub fn clear_secrets(&mut self) {
        self.password = None;
        self.secure_properties.clear();
    }
}

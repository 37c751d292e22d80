//! Connection configuration owned by a data source descriptor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::handler::{NetworkHandlerConfiguration, NetworkHandlerType};
use crate::error::RegistryError;
use crate::security::Credentials;

/// Lifecycle points at which a shell command hook may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionEventType {
    /// Before the connection is opened
    BeforeConnect,
    /// After the connection was opened
    AfterConnect,
    /// Before the connection is closed
    BeforeDisconnect,
    /// After the connection was closed
    AfterDisconnect,
}

impl ConnectionEventType {
    /// All event types in lifecycle order.
    pub const ALL: [Self; 4] = [
        Self::BeforeConnect,
        Self::AfterConnect,
        Self::BeforeDisconnect,
        Self::AfterDisconnect,
    ];

    /// Persisted name of the event type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeConnect => "BEFORE_CONNECT",
            Self::AfterConnect => "AFTER_CONNECT",
            Self::BeforeDisconnect => "BEFORE_DISCONNECT",
            Self::AfterDisconnect => "AFTER_DISCONNECT",
        }
    }
}

impl fmt::Display for ConnectionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionEventType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RegistryError::configuration(format!("Unknown event type '{}'", s)))
    }
}

/// Shell command bound to a connection event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShellCommand {
    /// Command line; may contain `${var}` references
    pub command: String,
    /// Only enabled commands run
    pub enabled: bool,
    /// Show the process output panel (host UI hint)
    pub show_panel: bool,
    /// Block the lifecycle step until the process exits
    pub wait_process_finish: bool,
    /// Upper bound for the wait in milliseconds; 0 waits forever
    pub wait_process_timeout_ms: u64,
    /// Kill the process when the connection is closed
    pub terminate_at_disconnect: bool,
    /// Delay after launching, in milliseconds
    pub pause_after_execute_ms: u64,
    /// Working directory for the process
    pub working_directory: Option<String>,
}

impl ShellCommand {
    /// Creates an enabled command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            enabled: true,
            ..Self::default()
        }
    }
}

/// Settings applied to a freshly opened connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionBootstrap {
    /// Initial auto-commit mode; `None` keeps the connection type default
    pub default_auto_commit: Option<bool>,
    /// Initial transaction isolation level (JDBC constant)
    pub default_transaction_isolation: Option<i32>,
    /// Catalog to activate after connect
    pub default_catalog: Option<String>,
    /// Schema to activate after connect
    pub default_schema: Option<String>,
    /// Continue when an init query fails
    pub ignore_errors: bool,
    /// Queries executed after connect, in order
    pub init_queries: Vec<String>,
}

impl ConnectionBootstrap {
    /// True when nothing would be written for this bootstrap.
    pub fn is_empty(&self) -> bool {
        self.default_auto_commit.is_none()
            && self.default_transaction_isolation.is_none()
            && self.default_catalog.is_none()
            && self.default_schema.is_none()
            && !self.ignore_errors
            && self.init_queries.is_empty()
    }
}

/// Everything needed to open one database connection.
///
/// # Security
/// `user_password`, `secure_auth_properties` and handler passwords are
/// secrets. They are never written to the plaintext configuration file and
/// are masked by the `Debug` implementation.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ConnectionConfiguration {
    /// Host name or address
    pub host: Option<String>,
    /// Port; kept as text since it may hold a `${var}` reference
    pub port: Option<String>,
    /// Server (instance) name
    pub server_name: Option<String>,
    /// Database name
    pub database_name: Option<String>,
    /// Explicit connection URL; overrides host/port/database when set
    pub url: Option<String>,
    /// Local client installation id
    pub client_home: Option<String>,
    /// Connection type id (policy bundle)
    pub connection_type: Option<String>,
    /// Display color override
    pub connection_color: Option<String>,
    /// Keep-alive interval in seconds; 0 disables
    pub keep_alive_interval: u32,
    /// Close the connection when idle
    pub close_idle_enabled: bool,
    /// Idle period in seconds before closing
    pub close_idle_interval: u32,
    /// Authentication model id
    pub auth_model: Option<String>,
    /// Non-secret authentication properties
    pub auth_properties: BTreeMap<String, String>,
    /// User name
    pub user_name: Option<String>,
    /// Password
    pub user_password: Option<String>,
    /// Secret authentication properties (tokens, key passphrases)
    pub secure_auth_properties: BTreeMap<String, String>,
    /// Name of the network profile whose handlers are merged at connect
    pub config_profile: Option<String>,
    /// Id of the auth profile supplying credentials at connect
    pub auth_profile: Option<String>,
    /// Driver properties
    pub properties: BTreeMap<String, String>,
    /// Provider-specific properties
    pub provider_properties: BTreeMap<String, String>,
    /// Network handlers (tunnels, proxies, config handlers)
    pub handlers: Vec<NetworkHandlerConfiguration>,
    /// Post-connect bootstrap settings
    pub bootstrap: ConnectionBootstrap,
    /// Shell command hooks keyed by lifecycle event
    pub events: BTreeMap<ConnectionEventType, ShellCommand>,
}

impl fmt::Debug for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_name", &self.server_name)
            .field("database_name", &self.database_name)
            .field(
                "url",
                &self.url.as_deref().map(crate::error::redact_database_url),
            )
            .field("connection_type", &self.connection_type)
            .field("auth_model", &self.auth_model)
            .field("user_name", &self.user_name)
            .field("has_password", &self.user_password.is_some())
            .field(
                "secure_auth_properties",
                &self.secure_auth_properties.keys().collect::<Vec<_>>(),
            )
            .field("config_profile", &self.config_profile)
            .field("auth_profile", &self.auth_profile)
            .field("properties", &self.properties)
            .field("handlers", &self.handlers)
            .field("bootstrap", &self.bootstrap)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_address())
    }
}

impl ConnectionConfiguration {
    /// Creates a configuration pointing at a host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::default()
        }
    }

    /// Builder method to set port.
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Builder method to set database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database_name = Some(database.into());
        self
    }

    /// Builder method to set the explicit URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Builder method to set user name and password.
    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user_name = Some(user.into());
        self.user_password = password;
        self
    }

    /// Builder method to set the connection type id.
    pub fn with_connection_type(mut self, type_id: impl Into<String>) -> Self {
        self.connection_type = Some(type_id.into());
        self
    }

    /// Builder method to add a driver property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builder method to add or replace a network handler.
    pub fn with_handler(mut self, handler: NetworkHandlerConfiguration) -> Self {
        self.update_handler(handler);
        self
    }

    /// Builder method to attach an event hook.
    pub fn with_event(mut self, event: ConnectionEventType, command: ShellCommand) -> Self {
        self.events.insert(event, command);
        self
    }

    /// Port parsed as a number, when it is one.
    pub fn port_number(&self) -> Option<u16> {
        self.port.as_deref().and_then(|p| p.trim().parse().ok())
    }

    /// Human-readable target without credentials.
    pub fn display_address(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return crate::error::redact_database_url(url);
        }
        let mut address = self.host.clone().unwrap_or_else(|| "<no host>".to_string());
        if let Some(port) = self.port.as_deref().filter(|p| !p.is_empty()) {
            address.push(':');
            address.push_str(port);
        }
        if let Some(database) = self.database_name.as_deref().filter(|d| !d.is_empty()) {
            address.push('/');
            address.push_str(database);
        }
        address
    }

    /// Finds a handler by id.
    pub fn handler(&self, id: &str) -> Option<&NetworkHandlerConfiguration> {
        self.handlers.iter().find(|h| h.id == id)
    }

    /// Finds a handler by id for modification.
    pub fn handler_mut(&mut self, id: &str) -> Option<&mut NetworkHandlerConfiguration> {
        self.handlers.iter_mut().find(|h| h.id == id)
    }

    /// Replaces the handler with the same id, or appends it.
    pub fn update_handler(&mut self, handler: NetworkHandlerConfiguration) {
        match self.handlers.iter_mut().find(|h| h.id == handler.id) {
            Some(existing) => *existing = handler,
            None => self.handlers.push(handler),
        }
    }

    /// Removes a handler by id; returns whether one was removed.
    pub fn remove_handler(&mut self, id: &str) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| h.id != id);
        before != self.handlers.len()
    }

    /// Enabled handlers of one type, in declaration order.
    pub fn enabled_handlers(
        &self,
        handler_type: NetworkHandlerType,
    ) -> impl Iterator<Item = &NetworkHandlerConfiguration> {
        self.handlers
            .iter()
            .filter(move |h| h.enabled && h.handler_type == handler_type)
    }

    /// Copies user name and password from prompt or provider credentials.
    pub fn apply_credentials(&mut self, credentials: &Credentials) {
        let (user, password) = credentials.to_config_values();
        if user.is_some() {
            self.user_name = user;
        }
        self.user_password = password;
    }

    /// True if any secret value is present.
    pub fn has_secrets(&self) -> bool {
        self.user_password.is_some()
            || !self.secure_auth_properties.is_empty()
            || self.handlers.iter().any(NetworkHandlerConfiguration::has_secrets)
    }

    /// Drops all secret values, keeping user names.
    pub fn clear_secrets(&mut self) {
        self.user_password = None;
        self.secure_auth_properties.clear();
        for handler in &mut self.handlers {
            handler.clear_secrets();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_roundtrip() {
        for event in ConnectionEventType::ALL {
            assert_eq!(event.as_str().parse::<ConnectionEventType>().unwrap(), event);
        }
        assert!("ON_IDLE".parse::<ConnectionEventType>().is_err());
    }

    #[test]
    fn test_display_address_prefers_url() {
        let config = ConnectionConfiguration::new("db.internal")
            .with_port("5432")
            .with_database("sales");
        assert_eq!(config.display_address(), "db.internal:5432/sales");

        let config = config.with_url("postgres://app:pw@db.internal/sales");
        assert!(!config.display_address().contains("pw@"));
    }

    #[test]
    fn test_update_handler_replaces_by_id() {
        let mut config = ConnectionConfiguration::default();
        config.update_handler(NetworkHandlerConfiguration::new(
            "ssh_tunnel",
            NetworkHandlerType::Tunnel,
        ));
        let mut replacement =
            NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel);
        replacement.enabled = false;
        config.update_handler(replacement);

        assert_eq!(config.handlers.len(), 1);
        assert!(!config.handlers[0].enabled);
        assert!(config.remove_handler("ssh_tunnel"));
        assert!(!config.remove_handler("ssh_tunnel"));
    }

    #[test]
    fn test_clear_secrets_keeps_user() {
        let mut handler = NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel);
        handler.password = Some("tunnel-pw".to_string());
        let mut config = ConnectionConfiguration::new("h")
            .with_credentials("scott", Some("tiger".to_string()))
            .with_handler(handler);
        config
            .secure_auth_properties
            .insert("token".to_string(), "abc".to_string());
        assert!(config.has_secrets());

        config.clear_secrets();
        assert!(!config.has_secrets());
        assert_eq!(config.user_name.as_deref(), Some("scott"));
    }

    #[test]
    fn test_debug_masks_password() {
        let config =
            ConnectionConfiguration::new("h").with_credentials("scott", Some("tiger".to_string()));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("tiger"));
        assert!(debug.contains("has_password: true"));
    }

    #[test]
    fn test_port_number() {
        assert_eq!(ConnectionConfiguration::new("h").with_port("5432").port_number(), Some(5432));
        assert_eq!(
            ConnectionConfiguration::new("h").with_port("${port}").port_number(),
            None
        );
    }
}

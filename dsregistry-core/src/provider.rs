//! Data source providers and the static driver table.
//!
//! A provider opens live connections for the drivers it owns. The registry
//! never talks to a database itself; it resolves the driver referenced by a
//! connection, finds the provider implementation registered for it and
//! hands over the resolved configuration.
//!
//! # Object Safety
//! Both traits are object-safe and used as `Arc<dyn DataSourceProvider>` /
//! `Box<dyn DataSourceHandle>`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::Result;
use crate::error::RegistryError;
use crate::model::{ConnectionConfiguration, DriverDescriptor};

/// A live connection opened by a provider.
#[async_trait]
pub trait DataSourceHandle: Send + Sync {
    /// Short description of the connected server (never credentials).
    fn server_description(&self) -> String;

    /// Closes the connection.
    ///
    /// # Errors
    /// Returns error if the shutdown fails; the handle is dropped regardless
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections for the drivers of one provider.
#[async_trait]
pub trait DataSourceProvider: Send + Sync {
    /// Opens a connection using the fully resolved configuration
    /// (secrets and variables substituted, tunnels already applied).
    ///
    /// # Errors
    /// Returns error if the connection cannot be established
    async fn open_data_source(
        &self,
        driver: &DriverDescriptor,
        config: &ConnectionConfiguration,
    ) -> Result<Box<dyn DataSourceHandle>>;
}

struct BuiltinDriver {
    provider: &'static str,
    provider_name: &'static str,
    id: &'static str,
    name: &'static str,
    class: &'static str,
    url: &'static str,
    port: Option<u16>,
    anonymous: bool,
    schemes: &'static [&'static str],
}

const BUILTIN_DRIVERS: &[BuiltinDriver] = &[
    BuiltinDriver {
        provider: "postgresql",
        provider_name: "PostgreSQL",
        id: "postgres-jdbc",
        name: "PostgreSQL",
        class: "org.postgresql.Driver",
        url: "jdbc:postgresql://{host}[:{port}]/[{database}]",
        port: Some(5432),
        anonymous: false,
        schemes: &["postgres", "postgresql"],
    },
    BuiltinDriver {
        provider: "mysql",
        provider_name: "MySQL",
        id: "mysql8",
        name: "MySQL",
        class: "com.mysql.cj.jdbc.Driver",
        url: "jdbc:mysql://{host}[:{port}]/[{database}]",
        port: Some(3306),
        anonymous: false,
        schemes: &["mysql", "mariadb"],
    },
    BuiltinDriver {
        provider: "sqlserver",
        provider_name: "SQL Server",
        id: "microsoft",
        name: "SQL Server",
        class: "com.microsoft.sqlserver.jdbc.SQLServerDriver",
        url: "jdbc:sqlserver://{host}[:{port}];databaseName={database}",
        port: Some(1433),
        anonymous: false,
        schemes: &["mssql", "sqlserver"],
    },
    BuiltinDriver {
        provider: "oracle",
        provider_name: "Oracle",
        id: "oracle_thin",
        name: "Oracle",
        class: "oracle.jdbc.OracleDriver",
        url: "jdbc:oracle:thin:@{host}[:{port}]/{database}",
        port: Some(1521),
        anonymous: false,
        schemes: &["oracle"],
    },
    BuiltinDriver {
        provider: "mongodb",
        provider_name: "MongoDB",
        id: "mongo",
        name: "MongoDB",
        class: "mongodb",
        url: "mongodb://{host}[:{port}]/{database}",
        port: Some(27017),
        anonymous: false,
        schemes: &["mongodb", "mongodb+srv"],
    },
    BuiltinDriver {
        provider: "sqlite",
        provider_name: "SQLite",
        id: "sqlite_jdbc",
        name: "SQLite",
        class: "org.sqlite.JDBC",
        url: "jdbc:sqlite:{file}",
        port: None,
        anonymous: true,
        schemes: &["sqlite"],
    },
];

struct ProviderEntry {
    name: String,
    implementation: Option<Arc<dyn DataSourceProvider>>,
    drivers: BTreeMap<String, Arc<DriverDescriptor>>,
}

impl ProviderEntry {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: None,
            drivers: BTreeMap::new(),
        }
    }
}

/// Table of providers and their drivers, populated at start-up.
#[derive(Default)]
pub struct DriverRegistry {
    providers: RwLock<BTreeMap<String, ProviderEntry>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers = self.providers.read();
        f.debug_struct("DriverRegistry")
            .field("providers", &providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in driver table. Providers have
    /// no implementation until one is registered.
    pub fn builtin() -> Self {
        let registry = Self::new();
        for builtin in BUILTIN_DRIVERS {
            registry.register_provider(builtin.provider, builtin.provider_name, None);
            let mut driver = DriverDescriptor::new(builtin.provider, builtin.id, builtin.name)
                .with_driver_class(builtin.class)
                .with_sample_url(builtin.url);
            driver.default_port = builtin.port;
            driver.anonymous_access = builtin.anonymous;
            registry.register_driver(driver);
        }
        registry
    }

    /// Registers a provider, or replaces its implementation if it exists.
    pub fn register_provider(
        &self,
        id: &str,
        name: &str,
        implementation: Option<Arc<dyn DataSourceProvider>>,
    ) {
        let mut providers = self.providers.write();
        let entry = providers
            .entry(id.to_string())
            .or_insert_with(|| ProviderEntry::new(name));
        entry.name = name.to_string();
        if implementation.is_some() {
            entry.implementation = implementation;
        }
    }

    /// Attaches an implementation to every known provider that has none.
    pub fn set_default_implementation(&self, implementation: &Arc<dyn DataSourceProvider>) {
        for entry in self.providers.write().values_mut() {
            if entry.implementation.is_none() {
                entry.implementation = Some(Arc::clone(implementation));
            }
        }
    }

    /// Adds a driver to its provider, creating the provider if needed.
    pub fn register_driver(&self, driver: DriverDescriptor) -> Arc<DriverDescriptor> {
        let driver = Arc::new(driver);
        let mut providers = self.providers.write();
        providers
            .entry(driver.provider_id().to_string())
            .or_insert_with(|| ProviderEntry::new(driver.provider_id()))
            .drivers
            .insert(driver.id().to_string(), Arc::clone(&driver));
        driver
    }

    /// True if the provider is known.
    pub fn has_provider(&self, provider_id: &str) -> bool {
        self.providers.read().contains_key(provider_id)
    }

    /// Display name of a provider.
    pub fn provider_name(&self, provider_id: &str) -> Option<String> {
        self.providers.read().get(provider_id).map(|p| p.name.clone())
    }

    /// Implementation registered for a provider.
    pub fn provider_implementation(&self, provider_id: &str) -> Option<Arc<dyn DataSourceProvider>> {
        self.providers
            .read()
            .get(provider_id)
            .and_then(|p| p.implementation.clone())
    }

    /// Looks a driver up.
    pub fn find_driver(&self, provider_id: &str, driver_id: &str) -> Option<Arc<DriverDescriptor>> {
        self.providers
            .read()
            .get(provider_id)
            .and_then(|p| p.drivers.get(driver_id).cloned())
    }

    /// Looks a driver up, fabricating placeholders for a missing provider
    /// or driver so the referencing connection stays loadable.
    pub fn resolve_driver(&self, provider_id: &str, driver_id: &str) -> Arc<DriverDescriptor> {
        if let Some(driver) = self.find_driver(provider_id, driver_id) {
            return driver;
        }
        if !self.has_provider(provider_id) {
            warn!(provider = provider_id, "Provider not found, creating placeholder");
            self.register_provider(provider_id, provider_id, None);
        }
        warn!(
            provider = provider_id,
            driver = driver_id,
            "Driver not found, creating placeholder"
        );
        self.register_driver(DriverDescriptor::placeholder(provider_id, driver_id))
    }

    /// Driver matching a URL scheme (`postgres://...`).
    pub fn find_driver_for_scheme(&self, scheme: &str) -> Option<Arc<DriverDescriptor>> {
        let scheme = scheme.to_ascii_lowercase();
        BUILTIN_DRIVERS
            .iter()
            .find(|b| b.schemes.contains(&scheme.as_str()))
            .and_then(|b| self.find_driver(b.provider, b.id))
    }

    /// All drivers ordered by provider then id.
    pub fn drivers(&self) -> Vec<Arc<DriverDescriptor>> {
        self.providers
            .read()
            .values()
            .flat_map(|p| p.drivers.values().cloned())
            .collect()
    }

    /// User-defined drivers, which are persisted with the configuration.
    pub fn custom_drivers(&self) -> Vec<Arc<DriverDescriptor>> {
        self.drivers().into_iter().filter(|d| d.custom).collect()
    }
}

/// Provider that checks reachability by opening a TCP socket to the
/// configured host and port, or by checking that a file database exists.
///
/// Used by the CLI `test` command where no database client is linked.
#[derive(Debug, Clone)]
pub struct SocketProbeProvider {
    timeout: Duration,
}

impl Default for SocketProbeProvider {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl SocketProbeProvider {
    /// Creates a probe with a connect timeout.
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

struct SocketProbeHandle {
    target: String,
    stream: Option<tokio::net::TcpStream>,
}

#[async_trait]
impl DataSourceHandle for SocketProbeHandle {
    fn server_description(&self) -> String {
        self.target.clone()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            use tokio::io::AsyncWriteExt;
            stream
                .shutdown()
                .await
                .map_err(|e| RegistryError::io(format!("Closing {}", self.target), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataSourceProvider for SocketProbeProvider {
    async fn open_data_source(
        &self,
        driver: &DriverDescriptor,
        config: &ConnectionConfiguration,
    ) -> Result<Box<dyn DataSourceHandle>> {
        let url_target = config
            .url
            .as_deref()
            .and_then(|u| url::Url::parse(u.strip_prefix("jdbc:").unwrap_or(u)).ok());

        if driver.anonymous_access && config.host.is_none() {
            let file = config
                .database_name
                .clone()
                .or_else(|| url_target.as_ref().map(|u| u.path().to_string()))
                .ok_or_else(|| RegistryError::configuration("No database file configured"))?;
            tokio::fs::metadata(&file)
                .await
                .map_err(|e| RegistryError::io(format!("Database file {}", file), e))?;
            return Ok(Box::new(SocketProbeHandle {
                target: file,
                stream: None,
            }));
        }

        let host = config
            .host
            .clone()
            .or_else(|| url_target.as_ref().and_then(|u| u.host_str().map(str::to_string)))
            .ok_or_else(|| RegistryError::configuration("No host configured"))?;
        let port = config
            .port_number()
            .or_else(|| url_target.as_ref().and_then(url::Url::port))
            .or(driver.default_port)
            .ok_or_else(|| RegistryError::configuration("No port configured"))?;

        let target = format!("{}:{}", host, port);
        debug!(target = target.as_str(), "Probing data source socket");
        let stream = tokio::time::timeout(
            self.timeout,
            tokio::net::TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| RegistryError::timeout(format!("Connecting to {}", target)))?
        .map_err(|e| RegistryError::connection_failed(format!("Connecting to {}", target), e))?;

        Ok(Box::new(SocketProbeHandle {
            target,
            stream: Some(stream),
        }))
    }
}

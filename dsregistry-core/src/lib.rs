//! Data source registry core.
//!
//! This crate keeps the connection definitions of a project: it loads them
//! from JSON (and legacy XML) configuration files, resolves their secrets
//! through a pluggable secret store, drives each connection through its
//! connect and disconnect lifecycle, and writes changes back with a
//! debounced save.
//!
//! # Security Guarantees
//! - Passwords never reach the plain configuration file; they go to the
//!   secret store or to the encrypted credentials file
//! - Secret values are redacted from `Debug` output and log records
//! - Credentials files and vaults use AES-GCM with Argon2id keys
//!
//! # Architecture
//! - [`registry::DataSourceRegistry`] owns descriptors and project-wide
//!   collections, reconciles files with live state and saves
//! - [`descriptor::DataSourceDescriptor`] runs the connection state machine
//! - [`serializer`] turns files into values and back, free of I/O
//! - [`secrets`], [`provider`], [`network`], [`hooks`] and [`auth`] are
//!   the seams a host plugs its own implementations into

pub mod auth;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod model;
pub mod network;
pub mod provider;
pub mod registry;
pub mod secrets;
pub mod security;
pub mod serializer;
pub mod storage;
pub mod variables;

// Re-export commonly used types
pub use config::RegistryConfig;
pub use descriptor::{ConnectionState, DataSourceDescriptor, DataSourceUser};
pub use error::{RegistryError, Result};
pub use model::{
    ConnectionConfiguration, DataSourceFolder, DataSourceOrigin, DataSourceSettings,
    DriverDescriptor, NetworkHandlerConfiguration, NetworkHandlerType,
};
pub use registry::{
    ChannelListener, DataSourceRegistry, LoadSummary, ParseOutcome, RegistryEvent,
    RegistryListener, RegistryServices,
};
pub use secrets::{FileSecretController, MemorySecretController, SecretController};
pub use serializer::SecretsMode;
pub use storage::ConfigurationStorage;

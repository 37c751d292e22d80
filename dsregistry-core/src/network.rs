//! Network handlers: tunnels, proxies and configuration handlers.
//!
//! The registry knows handler *descriptors* (what a handler id means and
//! which of its properties are secret). Live behaviour comes from
//! [`NetworkHandlerFactory`] implementations registered by the host; a
//! connection that enables a tunnel or proxy without a registered factory
//! fails to connect.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;
use crate::model::{ConnectionConfiguration, NetworkHandlerConfiguration, NetworkHandlerType};

/// A live network handler bound to one connection attempt.
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    /// Brings the handler up and returns the configuration the next stage
    /// should use. Tunnels typically rewrite host and port to a local
    /// forwarded endpoint.
    ///
    /// # Errors
    /// Returns error if the handler cannot be started
    async fn initialize(
        &mut self,
        handler: &NetworkHandlerConfiguration,
        connection: &ConnectionConfiguration,
    ) -> Result<ConnectionConfiguration>;

    /// Shuts the handler down.
    ///
    /// # Errors
    /// Returns error if shutdown fails
    async fn close(&mut self) -> Result<()>;
}

/// Creates handler instances for one handler id.
pub trait NetworkHandlerFactory: Send + Sync {
    /// Creates a fresh, uninitialized handler.
    fn create(&self) -> Box<dyn NetworkHandler>;
}

/// Static description of a handler id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandlerDescriptor {
    /// Handler id as persisted
    pub id: String,
    /// Display label
    pub label: String,
    /// Handler kind
    pub handler_type: NetworkHandlerType,
    /// Property names stored in secure storage rather than in the config
    pub secured_properties: Vec<String>,
}

impl NetworkHandlerDescriptor {
    /// Creates a descriptor without secured properties.
    pub fn new(id: impl Into<String>, label: impl Into<String>, handler_type: NetworkHandlerType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            handler_type,
            secured_properties: Vec::new(),
        }
    }

    /// Builder method to mark a property as secret.
    pub fn with_secured_property(mut self, name: impl Into<String>) -> Self {
        self.secured_properties.push(name.into());
        self
    }

    /// True if the named property must not be written in plain text.
    pub fn is_secured_property(&self, name: &str) -> bool {
        self.secured_properties.iter().any(|p| p == name)
    }
}

struct HandlerEntry {
    descriptor: NetworkHandlerDescriptor,
    factory: Option<Arc<dyn NetworkHandlerFactory>>,
}

/// Table of known network handlers.
#[derive(Default)]
pub struct NetworkHandlerRegistry {
    handlers: RwLock<BTreeMap<String, HandlerEntry>>,
}

impl std::fmt::Debug for NetworkHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandlerRegistry")
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NetworkHandlerRegistry {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the standard SSH tunnel, SOCKS proxy and SSL handlers.
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register(
            NetworkHandlerDescriptor::new("ssh_tunnel", "SSH", NetworkHandlerType::Tunnel)
                .with_secured_property("passphrase"),
            None,
        );
        registry.register(
            NetworkHandlerDescriptor::new("socks_proxy", "Proxy", NetworkHandlerType::Proxy),
            None,
        );
        registry.register(
            NetworkHandlerDescriptor::new("ssl", "SSL", NetworkHandlerType::Config)
                .with_secured_property("keyStorePassword"),
            None,
        );
        registry
    }

    /// Registers a handler descriptor, keeping an existing factory unless
    /// a new one is given.
    pub fn register(
        &self,
        descriptor: NetworkHandlerDescriptor,
        factory: Option<Arc<dyn NetworkHandlerFactory>>,
    ) {
        let mut handlers = self.handlers.write();
        let factory = factory.or_else(|| {
            handlers
                .get(&descriptor.id)
                .and_then(|entry| entry.factory.clone())
        });
        handlers.insert(descriptor.id.clone(), HandlerEntry { descriptor, factory });
    }

    /// Attaches a factory to a known handler id; returns false for unknown ids.
    pub fn register_factory(&self, id: &str, factory: Arc<dyn NetworkHandlerFactory>) -> bool {
        match self.handlers.write().get_mut(id) {
            Some(entry) => {
                entry.factory = Some(factory);
                true
            }
            None => false,
        }
    }

    /// Descriptor for a handler id.
    pub fn descriptor(&self, id: &str) -> Option<NetworkHandlerDescriptor> {
        self.handlers.read().get(id).map(|e| e.descriptor.clone())
    }

    /// Creates a live handler, if a factory is registered for the id.
    pub fn create(&self, id: &str) -> Option<Box<dyn NetworkHandler>> {
        self.handlers
            .read()
            .get(id)
            .and_then(|e| e.factory.as_ref())
            .map(|factory| factory.create())
    }
}

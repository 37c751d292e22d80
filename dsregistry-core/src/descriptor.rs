//! Data source descriptors and the connect/disconnect state machine.
//!
//! A descriptor owns the persisted [`DataSourceSettings`] of one data source
//! plus its runtime state: live handles, connection state, last error and
//! whether its secrets have been read from the secret controller.
//!
//! # Concurrency
//! - An atomic busy flag rejects a connect or disconnect while another one
//!   is in flight on the same descriptor (no queueing).
//! - Settings and runtime state sit behind short `parking_lot` locks that
//!   are never held across `.await`.
//! - Live handles sit behind an async mutex held for the whole bring-up or
//!   tear-down sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::auth::CredentialRequest;
use crate::error::RegistryError;
use crate::hooks::{RunningCommand, fire_event};
use crate::model::{
    ConnectionConfiguration, ConnectionEventType, DataSourceOrigin, DataSourceSettings,
    DriverDescriptor, NetworkHandlerConfiguration, NetworkHandlerType, VirtualModel,
};
use crate::network::NetworkHandler;
use crate::provider::DataSourceHandle;
use crate::registry::{RegistryEvent, RegistryShared};
use crate::secrets::{SecretRecord, data_source_handler_key, data_source_key, read_record};
use crate::serializer::DataSourceSnapshot;
use crate::storage::ConfigurationStorage;
use crate::variables::substitute_configuration;

const DEFAULT_USER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live connection
    #[default]
    Disconnected,
    /// Connect sequence running
    Connecting,
    /// Live connection open
    Connected,
    /// Disconnect sequence running
    Disconnecting,
    /// Last connect attempt failed; otherwise the same as `Disconnected`
    ConnectFailed,
}

impl ConnectionState {
    /// True for states without a live connection.
    pub const fn is_disconnected(self) -> bool {
        matches!(self, Self::Disconnected | Self::ConnectFailed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::ConnectFailed => "connect failed",
        };
        f.write_str(label)
    }
}

/// Work bound to a connected data source (editors, running queries).
///
/// Users are released before the connection is closed.
#[async_trait]
pub trait DataSourceUser: Send + Sync {
    /// Short label for logs.
    fn description(&self) -> String;

    /// Cancels running work and waits for it to stop.
    async fn release(&self);
}

#[derive(Debug, Default)]
struct RuntimeState {
    state: ConnectionState,
    connect_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    server_description: Option<String>,
}

/// Live resources of one connection, in bring-up order.
#[derive(Default)]
struct ConnectionHandles {
    data_source: Option<Box<dyn DataSourceHandle>>,
    network: Vec<Box<dyn NetworkHandler>>,
    hooks: Vec<Box<dyn RunningCommand>>,
}

impl ConnectionHandles {
    async fn close_all(&mut self, data_source_id: &str) {
        if let Some(mut handle) = self.data_source.take()
            && let Err(e) = handle.close().await
        {
            warn!(data_source = data_source_id, error = %e, "Error closing data source");
        }
        while let Some(mut handler) = self.network.pop() {
            if let Err(e) = handler.close().await {
                warn!(data_source = data_source_id, error = %e, "Error closing network handler");
            }
        }
    }

    async fn terminate_hooks(&mut self, data_source_id: &str) {
        for mut process in self.hooks.drain(..) {
            debug!(
                data_source = data_source_id,
                pid = ?process.process_id(),
                "Terminating hook process"
            );
            if let Err(e) = process.terminate().await {
                warn!(data_source = data_source_id, error = %e, "Cannot terminate hook process");
            }
        }
    }
}

/// Resets the busy flag when the guarded operation ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Holds the busy flag for one connect. If the connect future is dropped
/// while armed, the state falls back to `Disconnected` and whatever was
/// opened so far is closed on the runtime; the busy flag is released only
/// once the handles have been taken out.
struct ConnectAttempt<'a> {
    descriptor: &'a DataSourceDescriptor,
    armed: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn begin(descriptor: &'a DataSourceDescriptor) -> Option<Self> {
        descriptor
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { descriptor, armed: false })
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let ds = self.descriptor;
        if !self.armed {
            ds.busy.store(false, Ordering::Release);
            return;
        }
        {
            let mut runtime = ds.runtime.lock();
            runtime.state = ConnectionState::Disconnected;
            runtime.connect_time = None;
            runtime.server_description = None;
        }
        warn!(data_source = %ds.id, "Connect abandoned before it finished");

        let id = ds.id.clone();
        let busy = Arc::clone(&ds.busy);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime left to close on; handles are dropped with the descriptor
            busy.store(false, Ordering::Release);
            return;
        };
        if let Ok(mut guard) = ds.handles.try_lock() {
            let mut taken = std::mem::take(&mut *guard);
            drop(guard);
            busy.store(false, Ordering::Release);
            runtime.spawn(async move {
                taken.close_all(&id).await;
                taken.terminate_hooks(&id).await;
            });
        } else {
            let handles = Arc::clone(&ds.handles);
            runtime.spawn(async move {
                let mut taken = std::mem::take(&mut *handles.lock().await);
                busy.store(false, Ordering::Release);
                taken.close_all(&id).await;
                taken.terminate_hooks(&id).await;
            });
        }
    }
}

fn fill(target: &mut Option<String>, value: Option<String>, only_missing: bool) {
    if value.is_some() && (!only_missing || target.is_none()) {
        *target = value;
    }
}

/// Applies a connection secret record. With `only_missing`, values already
/// present (plaintext credentials from the file) win.
fn apply_connection_secrets(settings: &mut DataSourceSettings, record: SecretRecord, only_missing: bool) {
    let save_password = settings.save_password;
    let connection = &mut settings.connection;
    fill(&mut connection.user_name, record.user, only_missing);
    if save_password {
        fill(&mut connection.user_password, record.password, only_missing);
        for (name, value) in record.properties {
            if only_missing {
                connection.secure_auth_properties.entry(name).or_insert(value);
            } else {
                connection.secure_auth_properties.insert(name, value);
            }
        }
    }
}

fn apply_handler_secrets(
    connection: &mut ConnectionConfiguration,
    handler_id: &str,
    record: SecretRecord,
    only_missing: bool,
) {
    if let Some(handler) = connection.handler_mut(handler_id) {
        apply_handler_record(handler, record, only_missing);
    }
}

/// Applies a secret record to one network handler.
pub(crate) fn apply_handler_record(handler: &mut NetworkHandlerConfiguration, record: SecretRecord, only_missing: bool) {
    fill(&mut handler.user_name, record.user, only_missing);
    if handler.save_password {
        fill(&mut handler.password, record.password, only_missing);
    }
    for (name, value) in record.properties {
        if only_missing {
            handler.secure_properties.entry(name).or_insert(value);
        } else {
            handler.secure_properties.insert(name, value);
        }
    }
}

/// Generates a fresh data source id: `{driver_id}-{hex millis}-{hex random}`.
pub fn generate_new_id(driver: &DriverDescriptor) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    format!("{}-{:x}-{:x}", driver.id(), millis, rand::random::<u32>())
}

/// One data source: persisted settings plus connection runtime.
pub struct DataSourceDescriptor {
    id: String,
    storage: ConfigurationStorage,
    origin: DataSourceOrigin,
    registry: Weak<RegistryShared>,
    settings: Mutex<DataSourceSettings>,
    virtual_model: Mutex<Option<VirtualModel>>,
    provided: bool,
    temporary: AtomicBool,
    hidden: AtomicBool,
    secrets_resolved: AtomicBool,
    // Last secret read failed; the stored secrets must not be overwritten
    secrets_read_failed: AtomicBool,
    busy: Arc<AtomicBool>,
    runtime: Mutex<RuntimeState>,
    handles: Arc<tokio::sync::Mutex<ConnectionHandles>>,
    users: Mutex<Vec<Arc<dyn DataSourceUser>>>,
}

impl fmt::Debug for DataSourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceDescriptor")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("storage", &self.storage.storage_id())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl DataSourceDescriptor {
    pub(crate) fn new(
        id: impl Into<String>,
        storage: ConfigurationStorage,
        origin: DataSourceOrigin,
        settings: DataSourceSettings,
        registry: Weak<RegistryShared>,
    ) -> Self {
        Self {
            id: id.into(),
            storage,
            origin,
            registry,
            settings: Mutex::new(settings),
            virtual_model: Mutex::new(None),
            provided: false,
            temporary: AtomicBool::new(false),
            hidden: AtomicBool::new(false),
            secrets_resolved: AtomicBool::new(true),
            secrets_read_failed: AtomicBool::new(false),
            busy: Arc::new(AtomicBool::new(false)),
            runtime: Mutex::new(RuntimeState::default()),
            handles: Arc::new(tokio::sync::Mutex::new(ConnectionHandles::default())),
            users: Mutex::new(Vec::new()),
        }
    }

    /// Creates a descriptor that is not attached to any registry.
    ///
    /// Detached descriptors can be compared and copied but not connected.
    pub fn detached(id: impl Into<String>, storage: ConfigurationStorage, settings: DataSourceSettings) -> Self {
        Self::new(id, storage, DataSourceOrigin::Local, settings, Weak::new())
    }

    /// Marks the descriptor as supplied by the host rather than a file;
    /// provided descriptors survive purges.
    #[must_use]
    pub fn provided(mut self) -> Self {
        self.provided = true;
        self
    }

    pub(crate) fn with_virtual_model(self, model: Option<VirtualModel>) -> Self {
        *self.virtual_model.lock() = model;
        self
    }

    pub(crate) fn with_secrets_resolved(self, resolved: bool) -> Self {
        self.secrets_resolved.store(resolved, Ordering::Release);
        self.secrets_read_failed.store(false, Ordering::Release);
        self
    }

    fn registry(&self) -> Result<Arc<RegistryShared>> {
        self.registry
            .upgrade()
            .ok_or_else(|| RegistryError::configuration(format!("Data source '{}' is not attached to a registry", self.id)))
    }

    /// Data source id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.settings.lock().name.clone()
    }

    /// Storage the descriptor is persisted in.
    pub fn storage(&self) -> &ConfigurationStorage {
        &self.storage
    }

    /// Provenance.
    pub fn origin(&self) -> &DataSourceOrigin {
        &self.origin
    }

    /// Driver reference.
    pub fn driver(&self) -> Arc<DriverDescriptor> {
        Arc::clone(&self.settings.lock().driver)
    }

    /// Snapshot of the persisted settings.
    pub fn settings(&self) -> DataSourceSettings {
        self.settings.lock().clone()
    }

    /// Edits the settings in place. Callers save through the registry.
    pub fn update_settings<R>(&self, f: impl FnOnce(&mut DataSourceSettings) -> R) -> R {
        f(&mut self.settings.lock())
    }

    pub(crate) fn replace_settings(&self, settings: DataSourceSettings) {
        *self.settings.lock() = settings;
    }

    /// Attached virtual model.
    pub fn virtual_model(&self) -> Option<VirtualModel> {
        self.virtual_model.lock().clone()
    }

    /// Replaces the virtual model.
    pub fn set_virtual_model(&self, model: Option<VirtualModel>) {
        *self.virtual_model.lock() = model;
    }

    /// Host-provided descriptor.
    pub const fn is_provided(&self) -> bool {
        self.provided
    }

    /// Temporary descriptors are never saved.
    pub fn is_temporary(&self) -> bool {
        self.temporary.load(Ordering::Acquire)
    }

    /// Marks the descriptor temporary.
    pub fn set_temporary(&self, temporary: bool) {
        self.temporary.store(temporary, Ordering::Release);
    }

    /// Hidden descriptors are not listed.
    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Acquire)
    }

    /// Marks the descriptor hidden.
    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::Release);
    }

    /// Hidden or temporary.
    pub fn is_detached(&self) -> bool {
        self.is_hidden() || self.is_temporary()
    }

    /// True if the secrets were read (or there was nothing to read).
    pub fn is_secrets_resolved(&self) -> bool {
        self.secrets_resolved.load(Ordering::Acquire)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.runtime.lock().state
    }

    /// True while a live connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// When the current connection was opened.
    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.runtime.lock().connect_time
    }

    /// Error of the last failed connect attempt.
    pub fn last_connection_error(&self) -> Option<String> {
        self.runtime.lock().last_error.clone()
    }

    /// Server description reported by the open connection.
    pub fn server_description(&self) -> Option<String> {
        self.runtime.lock().server_description.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.runtime.lock().state = state;
    }

    /// Compares persisted settings.
    ///
    /// Covers name, description, save-password and read-only flags,
    /// navigator settings, driver, connection configuration, filters, lock
    /// password, folder, preferences and permissions.
    pub fn equal_settings(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let mine = self.settings();
        mine == *other.settings.lock()
    }

    /// Independent descriptor with the same settings under a new id.
    pub fn copy_as(&self, new_id: impl Into<String>) -> Self {
        let copy = Self::new(
            new_id,
            self.storage.clone(),
            DataSourceOrigin::Local,
            self.settings(),
            self.registry.clone(),
        );
        copy.set_virtual_model(self.virtual_model());
        copy.secrets_resolved.store(self.is_secrets_resolved(), Ordering::Release);
        copy
    }

    pub(crate) fn snapshot(&self) -> DataSourceSnapshot {
        DataSourceSnapshot {
            id: self.id.clone(),
            origin: self.origin.clone(),
            settings: self.settings(),
            virtual_model: self.virtual_model(),
            persist_secrets: self.is_secrets_resolved() && !self.secrets_read_failed.load(Ordering::Acquire),
        }
    }

    /// Registers work bound to this data source.
    pub fn add_user(&self, user: Arc<dyn DataSourceUser>) {
        self.users.lock().push(user);
    }

    /// Unregisters a user. Returns false if it was not registered.
    pub fn remove_user(&self, user: &Arc<dyn DataSourceUser>) -> bool {
        let mut users = self.users.lock();
        let before = users.len();
        users.retain(|u| !Arc::ptr_eq(u, user));
        before != users.len()
    }

    // Secrets

    /// Reads the secrets of this data source from the secret controller,
    /// once. Success and failure are both remembered until
    /// [`forget_secrets`](Self::forget_secrets).
    ///
    /// A controller failure is logged, leaves the password empty and stops
    /// further secret reads for the rest of the registry load. Saves skip
    /// the secrets of a descriptor whose read failed.
    ///
    /// Returns true if the secrets are available.
    pub async fn resolve_secrets_if_needed(&self) -> bool {
        if self.is_secrets_resolved() {
            return !self.secrets_read_failed.load(Ordering::Acquire);
        }
        let Ok(registry) = self.registry() else {
            return false;
        };
        self.resolve_secrets_from(&registry, false).await
    }

    pub(crate) async fn resolve_secrets_from(&self, registry: &RegistryShared, only_missing: bool) -> bool {
        let handler_ids: Vec<String> = self
            .settings
            .lock()
            .connection
            .handlers
            .iter()
            .map(|h| h.id.clone())
            .collect();
        let Some(controller) = registry.secret_controller() else {
            return self.resolve_file_secrets(registry, &handler_ids, only_missing).await;
        };
        if registry.password_read_canceled() {
            self.mark_secrets_failed();
            return false;
        }

        let project_id = registry.project_id();
        let loaded = async {
            let connection = read_record(controller.as_ref(), &data_source_key(project_id, &self.id)).await?;
            let mut handlers = Vec::new();
            for handler_id in handler_ids {
                let key = data_source_handler_key(project_id, &self.id, &handler_id);
                if let Some(record) = read_record(controller.as_ref(), &key).await? {
                    handlers.push((handler_id, record));
                }
            }
            Ok::<_, RegistryError>((connection, handlers))
        }
        .await;

        match loaded {
            Ok((connection, handlers)) => {
                let mut settings = self.settings.lock();
                if let Some(record) = connection {
                    apply_connection_secrets(&mut settings, record, only_missing);
                }
                for (handler_id, record) in handlers {
                    apply_handler_secrets(&mut settings.connection, &handler_id, record, only_missing);
                }
                debug!(data_source = %self.id, "Resolved secure credentials");
            }
            Err(e) => {
                warn!(
                    data_source = %self.id,
                    error = %e,
                    "Cannot read secure credentials, continuing without password"
                );
                registry.cancel_password_reads();
                self.mark_secrets_failed();
                return false;
            }
        }
        self.secrets_read_failed.store(false, Ordering::Release);
        self.secrets_resolved.store(true, Ordering::Release);
        true
    }

    async fn resolve_file_secrets(&self, registry: &RegistryShared, handler_ids: &[String], only_missing: bool) -> bool {
        match registry.read_file_secrets(&self.storage, &self.id, handler_ids).await {
            Ok((connection, handlers)) => {
                let mut settings = self.settings.lock();
                if let Some(record) = connection {
                    apply_connection_secrets(&mut settings, record, only_missing);
                }
                for (handler_id, record) in handlers {
                    apply_handler_secrets(&mut settings.connection, &handler_id, record, only_missing);
                }
            }
            Err(e) => {
                warn!(data_source = %self.id, error = %e, "Cannot read credentials file, continuing without password");
                self.mark_secrets_failed();
                return false;
            }
        }
        self.secrets_read_failed.store(false, Ordering::Release);
        self.secrets_resolved.store(true, Ordering::Release);
        true
    }

    fn mark_secrets_failed(&self) {
        self.secrets_read_failed.store(true, Ordering::Release);
        self.secrets_resolved.store(true, Ordering::Release);
    }

    /// Drops in-memory secret values; the next connect reads them again.
    pub fn forget_secrets(&self) {
        self.settings.lock().connection.clear_secrets();
        self.secrets_read_failed.store(false, Ordering::Release);
        self.secrets_resolved.store(false, Ordering::Release);
    }

    // Connect / disconnect

    /// Opens a connection.
    ///
    /// Returns `Ok(false)` when another connect or disconnect is running,
    /// the descriptor is already connected, or the user cancelled the
    /// credentials prompt.
    ///
    /// # Errors
    /// Returns error if any stage fails: credential sources, network
    /// handlers or the provider. All partially opened handles are closed,
    /// the error is recorded as the last connection error and a
    /// [`RegistryEvent::ConnectionFailed`] is emitted.
    ///
    /// Dropping the returned future (for example under a timeout) leaves
    /// the descriptor `Disconnected`; handlers started so far are closed in
    /// the background.
    pub async fn connect(&self) -> Result<bool> {
        let Some(mut attempt) = ConnectAttempt::begin(self) else {
            debug!(data_source = %self.id, "Connect rejected, another operation is running");
            return Ok(false);
        };
        if self.is_connected() {
            return Ok(false);
        }
        let registry = self.registry()?;
        self.set_state(ConnectionState::Connecting);
        info!(data_source = %self.id, "Connecting");

        attempt.armed = true;
        let outcome = self.open_connection(&registry).await;
        attempt.armed = false;
        match outcome {
            Ok(true) => {
                {
                    let mut runtime = self.runtime.lock();
                    runtime.state = ConnectionState::Connected;
                    runtime.connect_time = Some(Utc::now());
                    runtime.last_error = None;
                }
                registry.notify(RegistryEvent::ConnectionOpened { id: self.id.clone() });
                Ok(true)
            }
            Ok(false) => {
                self.set_state(ConnectionState::Disconnected);
                info!(data_source = %self.id, "Connect cancelled");
                Ok(false)
            }
            Err(e) => {
                {
                    let mut runtime = self.runtime.lock();
                    runtime.state = ConnectionState::ConnectFailed;
                    runtime.connect_time = None;
                    runtime.server_description = None;
                    runtime.last_error = Some(e.to_string());
                }
                error!(data_source = %self.id, error = %e, "Connection failed");
                registry.notify(RegistryEvent::ConnectionFailed {
                    id: self.id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn open_connection(&self, registry: &RegistryShared) -> Result<bool> {
        let executor = registry.command_executor();
        let mut hook_config = self.settings.lock().connection.clone();
        substitute_configuration(&mut hook_config, registry.use_env_variables());
        let before = fire_event(executor, &self.id, ConnectionEventType::BeforeConnect, &hook_config).await;

        let mut handles = self.handles.lock().await;
        handles.hooks.extend(before);

        let outcome = match self.resolve_configuration(registry).await {
            Ok(Some(config)) => {
                hook_config = config.clone();
                self.bring_up(registry, config, &mut handles).await.map(|()| true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };

        if matches!(outcome, Ok(true)) {
            let after = fire_event(executor, &self.id, ConnectionEventType::AfterConnect, &hook_config).await;
            handles.hooks.extend(after);
        } else {
            handles.close_all(&self.id).await;
            handles.terminate_hooks(&self.id).await;
        }
        outcome
    }

    /// Builds the configuration handed to network handlers and the
    /// provider. `None` means the credentials prompt was cancelled.
    async fn resolve_configuration(&self, registry: &RegistryShared) -> Result<Option<ConnectionConfiguration>> {
        self.resolve_secrets_if_needed().await;
        let settings = self.settings();
        let mut config = settings.connection.clone();

        if let DataSourceOrigin::External { kind, .. } = &self.origin
            && let Some(origin) = registry.origin(kind)
            && origin.is_dynamic()
        {
            debug!(data_source = %self.id, origin = %kind, "Pulling credentials from origin");
            origin.resolve_credentials(&self.id, &mut config).await?;
        }

        if let Some(profile_name) = config.config_profile.clone() {
            match registry.network_profile(&profile_name) {
                Some(profile) => profile.apply_to(&mut config),
                None => warn!(data_source = %self.id, profile = %profile_name, "Network profile not found"),
            }
        }
        if let Some(profile_id) = config.auth_profile.clone() {
            match registry.auth_profile(&profile_id) {
                Some(profile) => profile.apply_to(&mut config),
                None => warn!(data_source = %self.id, profile = %profile_id, "Auth profile not found"),
            }
        }

        let provided = match registry.credential_provider() {
            Some(provider) => provider.provide_credentials(&self.id, &mut config).await?,
            None => false,
        };
        let needs_prompt = !provided
            && !settings.save_password
            && !settings.driver.anonymous_access
            && config.auth_profile.is_none()
            && config.user_password.is_none();
        if needs_prompt {
            let request = CredentialRequest {
                data_source_id: self.id.clone(),
                data_source_name: settings.name.clone(),
                user_name: config.user_name.clone(),
                prompt: format!("Credentials for '{}'", settings.name),
            };
            match registry.auth_prompt().prompt_credentials(&request).await? {
                Some(credentials) => config.apply_credentials(&credentials),
                None => return Ok(None),
            }
        }

        substitute_configuration(&mut config, registry.use_env_variables());
        Ok(Some(config))
    }

    /// Proxy first, then tunnel, then the data source itself.
    async fn bring_up(
        &self,
        registry: &RegistryShared,
        mut config: ConnectionConfiguration,
        handles: &mut ConnectionHandles,
    ) -> Result<()> {
        for handler_type in [NetworkHandlerType::Proxy, NetworkHandlerType::Tunnel] {
            let configs: Vec<_> = config.enabled_handlers(handler_type).cloned().collect();
            for handler_config in configs {
                let mut handler = registry
                    .network_handlers()
                    .create(&handler_config.id)
                    .ok_or_else(|| {
                        RegistryError::network_handler(handler_config.id.as_str(), "No implementation registered")
                    })?;
                debug!(data_source = %self.id, handler = %handler_config.id, "Starting network handler");
                match handler.initialize(&handler_config, &config).await {
                    Ok(next) => {
                        config = next;
                        handles.network.push(handler);
                    }
                    Err(e) => {
                        if let Err(close_err) = handler.close().await {
                            debug!(handler = %handler_config.id, error = %close_err, "Error closing failed handler");
                        }
                        return Err(e);
                    }
                }
            }
        }

        let driver = self.driver();
        let provider = registry
            .drivers()
            .provider_implementation(driver.provider_id())
            .ok_or_else(|| RegistryError::unsupported_feature("connect", driver.full_id()))?;
        let handle = provider.open_data_source(&driver, &config).await?;
        let server = handle.server_description();
        info!(data_source = %self.id, server = %server, "Connected");
        self.runtime.lock().server_description = Some(server);
        handles.data_source = Some(handle);
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Returns true when the descriptor is disconnected afterwards
    /// (including when it was not connected), false when a connect or
    /// disconnect is running. Users are released first with a bounded
    /// wait; close failures are logged and the state is cleared anyway.
    pub async fn disconnect(&self) -> bool {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            debug!(data_source = %self.id, "Disconnect rejected, another operation is running");
            return false;
        };
        if !self.is_connected() {
            return true;
        }
        self.set_state(ConnectionState::Disconnecting);
        info!(data_source = %self.id, "Disconnecting");

        let registry = self.registry.upgrade();
        let drain_timeout = registry
            .as_ref()
            .map_or(DEFAULT_USER_DRAIN_TIMEOUT, |r| r.user_drain_timeout());
        self.release_users(drain_timeout).await;

        let mut hook_config = self.settings.lock().connection.clone();
        if let Some(registry) = &registry {
            substitute_configuration(&mut hook_config, registry.use_env_variables());
        }
        let mut handles = self.handles.lock().await;
        if let Some(registry) = &registry {
            let before =
                fire_event(registry.command_executor(), &self.id, ConnectionEventType::BeforeDisconnect, &hook_config)
                    .await;
            handles.hooks.extend(before);
        }
        handles.close_all(&self.id).await;
        if let Some(registry) = &registry {
            let after =
                fire_event(registry.command_executor(), &self.id, ConnectionEventType::AfterDisconnect, &hook_config)
                    .await;
            handles.hooks.extend(after);
        }
        handles.terminate_hooks(&self.id).await;
        drop(handles);

        {
            let mut runtime = self.runtime.lock();
            runtime.state = ConnectionState::Disconnected;
            runtime.connect_time = None;
            runtime.server_description = None;
        }
        info!(data_source = %self.id, "Disconnected");
        if let Some(registry) = &registry {
            registry.notify(RegistryEvent::ConnectionClosed { id: self.id.clone() });
        }
        true
    }

    async fn release_users(&self, timeout: Duration) {
        let users: Vec<Arc<dyn DataSourceUser>> = self.users.lock().clone();
        if users.is_empty() {
            return;
        }
        debug!(data_source = %self.id, users = users.len(), "Releasing data source users");
        let release = join_all(users.iter().map(|user| user.release()));
        if tokio::time::timeout(timeout, release).await.is_err() {
            let pending: Vec<String> = users.iter().map(|u| u.description()).collect();
            warn!(
                data_source = %self.id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                users = ?pending,
                "Data source users did not stop in time"
            );
        }
    }

    /// Disconnects, then connects again.
    ///
    /// # Errors
    /// Returns error if the connect fails
    pub async fn reconnect(&self) -> Result<bool> {
        if !self.disconnect().await {
            return Ok(false);
        }
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkHandlerConfiguration, ObjectFilter};
    use std::path::Path;

    fn descriptor(id: &str) -> DataSourceDescriptor {
        let driver = Arc::new(DriverDescriptor::new("postgresql", "postgres-jdbc", "PostgreSQL"));
        let connection = ConnectionConfiguration::new("db.internal")
            .with_credentials("scott", Some("tiger".to_string()));
        let settings = DataSourceSettings::new("Sales", driver, connection);
        DataSourceDescriptor::detached(
            id,
            ConfigurationStorage::default_modern(Path::new("/project/.dbeaver")),
            settings,
        )
    }

    #[test]
    fn test_generate_new_id_format() {
        let driver = DriverDescriptor::new("postgresql", "postgres-jdbc", "PostgreSQL");
        let id = generate_new_id(&driver);
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], "postgres-jdbc");
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_new_id(&driver), id);
    }

    #[test]
    fn test_busy_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = BusyGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(BusyGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(BusyGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_equal_settings_and_copy() {
        let original = descriptor("a");
        let copy = original.copy_as("b");
        assert_eq!(copy.id(), "b");
        assert!(original.equal_settings(&copy));
        assert!(original.equal_settings(&original));

        copy.update_settings(|s| s.update_object_filter(ObjectFilter::new("schema").including(["public"])));
        assert!(!original.equal_settings(&copy));
        assert!(original.settings().filters.is_empty());
    }

    #[test]
    fn test_detached_flags() {
        let ds = descriptor("a");
        assert!(!ds.is_detached());
        ds.set_hidden(true);
        assert!(ds.is_detached());
        ds.set_hidden(false);
        ds.set_temporary(true);
        assert!(ds.is_detached());
    }

    #[test]
    fn test_forget_secrets_keeps_user() {
        let ds = descriptor("a");
        ds.forget_secrets();
        assert!(!ds.is_secrets_resolved());
        let settings = ds.settings();
        assert_eq!(settings.connection.user_name.as_deref(), Some("scott"));
        assert_eq!(settings.connection.user_password, None);
    }

    #[test]
    fn test_apply_secrets_only_missing_keeps_plaintext() {
        let ds = descriptor("a");
        let record = SecretRecord {
            user: Some("other".to_string()),
            password: Some("stored".to_string()),
            properties: [("token".to_string(), "t".to_string())].into(),
        };
        ds.update_settings(|s| {
            s.connection.user_password = None;
            apply_connection_secrets(s, record.clone(), true);
        });
        let settings = ds.settings();
        assert_eq!(settings.connection.user_name.as_deref(), Some("scott"));
        assert_eq!(settings.connection.user_password.as_deref(), Some("stored"));

        ds.update_settings(|s| apply_connection_secrets(s, record, false));
        assert_eq!(ds.settings().connection.user_name.as_deref(), Some("other"));
    }

    #[test]
    fn test_handler_secrets_respect_save_password() {
        let mut connection = ConnectionConfiguration::new("h")
            .with_handler(NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel));
        let record = SecretRecord {
            user: Some("jump".to_string()),
            password: Some("pw".to_string()),
            properties: Default::default(),
        };
        apply_handler_secrets(&mut connection, "ssh_tunnel", record, false);
        let handler = connection.handler("ssh_tunnel").unwrap();
        assert_eq!(handler.user_name.as_deref(), Some("jump"));
        assert_eq!(handler.password, None);
    }

    #[tokio::test]
    async fn test_detached_descriptor_cannot_connect() {
        let ds = descriptor("a");
        assert!(ds.connect().await.is_err());
        assert_eq!(ds.connection_state(), ConnectionState::Disconnected);
        assert!(ds.disconnect().await);
    }
}

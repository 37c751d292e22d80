//! The data source registry of one project.
//!
//! The registry owns every [`DataSourceDescriptor`] of a project together
//! with the project-wide collections persisted next to them: folders,
//! network and auth profiles, saved filters, connection types and opaque
//! external configurations. Loading, reconciling and saving live in
//! `persistence`; change notifications in `events`.
//!
//! # Locking
//! Collections sit behind one coarse `parking_lot` lock. Guards are never
//! held across `.await`; async work (secret controller calls, disconnects)
//! happens on snapshots taken under the lock.

mod events;
mod persistence;

pub use events::{ChannelListener, RegistryEvent, RegistryListener};
pub use persistence::{LoadSummary, ParseOutcome};

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Result;
use crate::auth::{AuthPrompt, CredentialProvider, ExternalOrigin, NonInteractivePrompt};
use crate::config::RegistryConfig;
use crate::descriptor::{DataSourceDescriptor, generate_new_id};
use crate::error::RegistryError;
use crate::hooks::{CommandExecutor, ProcessCommandExecutor};
use crate::model::{
    AuthProfile, ConnectionTypeRegistry, DataSourceFolder, DataSourceOrigin, DataSourceSettings,
    FOLDER_PATH_SEPARATOR, NetworkProfile, ObjectFilter,
};
use crate::network::NetworkHandlerRegistry;
use crate::provider::DriverRegistry;
use crate::secrets::{SecretController, auth_profile_key, data_source_key, network_profile_handler_key};
use crate::security::encryption::ValueEncryptor;
use crate::serializer::SecretsMode;
use crate::storage::ConfigurationStorage;
use events::ListenerSet;

/// Collaborators the registry delegates to.
///
/// Defaults: built-in driver and handler tables, no secret controller
/// (secrets go to the credentials file), hooks run through the system
/// shell, no global credential provider and a prompt that always cancels.
pub struct RegistryServices {
    /// Driver table
    pub drivers: Arc<DriverRegistry>,
    /// Network handler table
    pub network_handlers: Arc<NetworkHandlerRegistry>,
    /// Secret store; used when the configuration enables secret storage
    pub secret_controller: Option<Arc<dyn SecretController>>,
    /// Runs connection event hooks
    pub command_executor: Arc<dyn CommandExecutor>,
    /// Global credential source
    pub credential_provider: Option<Arc<dyn CredentialProvider>>,
    /// Interactive credentials prompt
    pub auth_prompt: Arc<dyn AuthPrompt>,
    /// External data source origins
    pub origins: Vec<Arc<dyn ExternalOrigin>>,
    /// Project key for the credentials file and project encryption
    pub encryptor: Option<ValueEncryptor>,
}

impl Default for RegistryServices {
    fn default() -> Self {
        Self {
            drivers: Arc::new(DriverRegistry::builtin()),
            network_handlers: Arc::new(NetworkHandlerRegistry::builtin()),
            secret_controller: None,
            command_executor: Arc::new(ProcessCommandExecutor),
            credential_provider: None,
            auth_prompt: Arc::new(NonInteractivePrompt),
            origins: Vec::new(),
            encryptor: None,
        }
    }
}

impl std::fmt::Debug for RegistryServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryServices")
            .field("drivers", &self.drivers)
            .field("network_handlers", &self.network_handlers)
            .field("secret_controller", &self.secret_controller.is_some())
            .field("credential_provider", &self.credential_provider.is_some())
            .field("origins", &self.origins.len())
            .field("encryptor", &self.encryptor.is_some())
            .finish_non_exhaustive()
    }
}

impl RegistryServices {
    /// Default collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a shared driver table.
    #[must_use]
    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    /// Uses a shared network handler table.
    #[must_use]
    pub fn with_network_handlers(mut self, handlers: Arc<NetworkHandlerRegistry>) -> Self {
        self.network_handlers = handlers;
        self
    }

    /// Sets the secret store.
    #[must_use]
    pub fn with_secret_controller(mut self, controller: Arc<dyn SecretController>) -> Self {
        self.secret_controller = Some(controller);
        self
    }

    /// Sets the hook executor.
    #[must_use]
    pub fn with_command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.command_executor = executor;
        self
    }

    /// Sets the global credential source.
    #[must_use]
    pub fn with_credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    /// Sets the interactive prompt.
    #[must_use]
    pub fn with_auth_prompt(mut self, prompt: Arc<dyn AuthPrompt>) -> Self {
        self.auth_prompt = prompt;
        self
    }

    /// Registers an external origin.
    #[must_use]
    pub fn with_origin(mut self, origin: Arc<dyn ExternalOrigin>) -> Self {
        self.origins.push(origin);
        self
    }

    /// Sets the project key.
    #[must_use]
    pub fn with_encryptor(mut self, encryptor: ValueEncryptor) -> Self {
        self.encryptor = Some(encryptor);
        self
    }
}

#[derive(Default)]
struct RegistryState {
    data_sources: Vec<Arc<DataSourceDescriptor>>,
    folders: Vec<DataSourceFolder>,
    network_profiles: Vec<NetworkProfile>,
    auth_profiles: Vec<AuthProfile>,
    saved_filters: Vec<ObjectFilter>,
    external_configurations: BTreeMap<String, Value>,
    storages: Vec<ConfigurationStorage>,
}

/// State shared by the registry handle, its descriptors and its save task.
pub(crate) struct RegistryShared {
    config: RegistryConfig,
    services: RegistryServices,
    secrets_mode: SecretsMode,
    connection_types: ConnectionTypeRegistry,
    state: RwLock<RegistryState>,
    listeners: ListenerSet,
    password_read_canceled: AtomicBool,
    save_in_progress: AtomicBool,
    save_scheduled: AtomicBool,
    save_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl RegistryShared {
    pub(crate) fn project_id(&self) -> &str {
        &self.config.project_id
    }

    pub(crate) const fn use_env_variables(&self) -> bool {
        self.config.use_env_variables
    }

    pub(crate) const fn user_drain_timeout(&self) -> Duration {
        self.config.user_drain_timeout
    }

    pub(crate) fn drivers(&self) -> &DriverRegistry {
        &self.services.drivers
    }

    pub(crate) fn network_handlers(&self) -> &NetworkHandlerRegistry {
        &self.services.network_handlers
    }

    pub(crate) fn command_executor(&self) -> &dyn CommandExecutor {
        self.services.command_executor.as_ref()
    }

    pub(crate) fn credential_provider(&self) -> Option<&dyn CredentialProvider> {
        self.services.credential_provider.as_deref()
    }

    pub(crate) fn auth_prompt(&self) -> &dyn AuthPrompt {
        self.services.auth_prompt.as_ref()
    }

    pub(crate) fn origin(&self, kind: &str) -> Option<&dyn ExternalOrigin> {
        self.services
            .origins
            .iter()
            .find(|o| o.id() == kind)
            .map(AsRef::as_ref)
    }

    /// The secret store, when secrets are kept there.
    pub(crate) fn secret_controller(&self) -> Option<&Arc<dyn SecretController>> {
        match self.secrets_mode {
            SecretsMode::Controller => self.services.secret_controller.as_ref(),
            SecretsMode::CredentialsFile => None,
        }
    }

    pub(crate) fn password_read_canceled(&self) -> bool {
        self.password_read_canceled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_password_reads(&self) {
        self.password_read_canceled.store(true, Ordering::Release);
    }

    pub(crate) fn network_profile(&self, name: &str) -> Option<NetworkProfile> {
        self.state
            .read()
            .network_profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub(crate) fn auth_profile(&self, id: &str) -> Option<AuthProfile> {
        self.state.read().auth_profiles.iter().find(|p| p.id == id).cloned()
    }

    pub(crate) fn notify(&self, event: RegistryEvent) {
        self.listeners.notify(event);
    }

    fn data_source(&self, id: &str) -> Option<Arc<DataSourceDescriptor>> {
        self.state
            .read()
            .data_sources
            .iter()
            .find(|d| d.id() == id)
            .cloned()
    }

    /// Deletes secret keys; failures are logged.
    async fn delete_secrets(&self, keys: &[String]) {
        let Some(controller) = self.secret_controller() else {
            return;
        };
        for key in keys {
            if let Err(e) = controller.delete(key).await {
                warn!(key = %key, error = %e, "Cannot delete secret");
            }
        }
        if let Err(e) = controller.flush().await {
            warn!(error = %e, "Cannot flush secret store");
        }
    }
}

/// Rewrites `path` when it lies in the subtree at `old`: the folder itself
/// maps to `new_parent`, descendants keep their relative path below it.
/// Returns `None` for paths outside the subtree.
fn rebase_path(path: &str, old: &str, new_parent: Option<&str>) -> Option<Option<String>> {
    if path == old {
        return Some(new_parent.map(str::to_string));
    }
    let rest = path.strip_prefix(old)?.strip_prefix(FOLDER_PATH_SEPARATOR)?;
    Some(Some(match new_parent {
        Some(parent) => format!("{}{}{}", parent, FOLDER_PATH_SEPARATOR, rest),
        None => rest.to_string(),
    }))
}

/// Registry of data sources for one project.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
/// ```rust,no_run
/// use dsregistry_core::{DataSourceRegistry, RegistryConfig, RegistryServices};
///
/// # async fn example() -> dsregistry_core::Result<()> {
/// let config = RegistryConfig::new("/work/project");
/// let registry = DataSourceRegistry::open(config, RegistryServices::new()).await?;
/// for ds in registry.data_sources() {
///     println!("{} ({})", ds.name(), ds.id());
/// }
/// registry.dispose().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DataSourceRegistry {
    shared: Arc<RegistryShared>,
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("project", &self.shared.config.project_id)
            .field("data_sources", &self.shared.state.read().data_sources.len())
            .field("secrets_mode", &self.shared.secrets_mode)
            .finish_non_exhaustive()
    }
}

impl DataSourceRegistry {
    /// Creates an empty registry. Call [`load`](Self::load) to read the
    /// project's configuration files.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub fn new(config: RegistryConfig, services: RegistryServices) -> Result<Self> {
        config.validate()?;
        let secrets_mode = match (&services.secret_controller, config.use_secret_storage) {
            (Some(_), true) => SecretsMode::Controller,
            (None, true) => {
                warn!("Secret storage enabled but no secret controller configured, using credentials file");
                SecretsMode::CredentialsFile
            }
            (_, false) => SecretsMode::CredentialsFile,
        };
        debug!(project = %config.project_id, ?secrets_mode, "Creating data source registry");
        let state = RegistryState {
            storages: vec![config.default_storage()],
            ..RegistryState::default()
        };
        Ok(Self {
            shared: Arc::new(RegistryShared {
                config,
                services,
                secrets_mode,
                connection_types: ConnectionTypeRegistry::new(),
                state: RwLock::new(state),
                listeners: ListenerSet::default(),
                password_read_canceled: AtomicBool::new(false),
                save_in_progress: AtomicBool::new(false),
                save_scheduled: AtomicBool::new(false),
                save_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a registry and loads the project.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the default
    /// storage cannot be read
    pub async fn open(config: RegistryConfig, services: RegistryServices) -> Result<Self> {
        let registry = Self::new(config, services)?;
        registry.load().await?;
        Ok(registry)
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Where secrets are persisted.
    pub fn secrets_mode(&self) -> SecretsMode {
        self.shared.secrets_mode
    }

    /// Driver table.
    pub fn drivers(&self) -> &DriverRegistry {
        self.shared.drivers()
    }

    /// Network handler table.
    pub fn network_handlers(&self) -> &NetworkHandlerRegistry {
        self.shared.network_handlers()
    }

    /// Connection types known to the project.
    pub fn connection_types(&self) -> &ConnectionTypeRegistry {
        &self.shared.connection_types
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.shared.listeners.add(listener);
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn RegistryListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    // Data sources

    /// All descriptors, in load order.
    pub fn data_sources(&self) -> Vec<Arc<DataSourceDescriptor>> {
        self.shared.state.read().data_sources.clone()
    }

    /// Descriptor by id.
    pub fn data_source(&self, id: &str) -> Option<Arc<DataSourceDescriptor>> {
        self.shared.data_source(id)
    }

    /// First descriptor with the given display name.
    pub fn find_data_source_by_name(&self, name: &str) -> Option<Arc<DataSourceDescriptor>> {
        self.shared
            .state
            .read()
            .data_sources
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Descriptors directly in `folder` (`None` for the root).
    pub fn data_sources_in_folder(&self, folder: Option<&str>) -> Vec<Arc<DataSourceDescriptor>> {
        self.shared
            .state
            .read()
            .data_sources
            .iter()
            .filter(|d| d.settings().folder.as_deref() == folder)
            .cloned()
            .collect()
    }

    /// Creates a descriptor with a generated id in the default storage.
    /// It is not registered until [`add_data_source`](Self::add_data_source).
    pub fn new_data_source(&self, settings: DataSourceSettings) -> DataSourceDescriptor {
        let id = generate_new_id(&settings.driver);
        self.new_data_source_with_id(id, settings)
    }

    /// Creates a descriptor with an explicit id in the default storage.
    pub fn new_data_source_with_id(&self, id: impl Into<String>, settings: DataSourceSettings) -> DataSourceDescriptor {
        DataSourceDescriptor::new(
            id,
            self.shared.config.default_storage(),
            DataSourceOrigin::Local,
            settings,
            Arc::downgrade(&self.shared),
        )
    }

    /// Registers a descriptor and schedules a save. Its folder is created
    /// when missing.
    ///
    /// # Errors
    /// Returns error if a descriptor with the same id exists
    pub fn add_data_source(&self, descriptor: DataSourceDescriptor) -> Result<Arc<DataSourceDescriptor>> {
        let descriptor = Arc::new(descriptor);
        {
            let mut state = self.shared.state.write();
            if state.data_sources.iter().any(|d| d.id() == descriptor.id()) {
                return Err(RegistryError::configuration(format!(
                    "Data source '{}' already exists",
                    descriptor.id()
                )));
            }
            state.data_sources.push(Arc::clone(&descriptor));
        }
        if let Some(folder) = descriptor.settings().folder {
            self.find_folder_by_path(&folder, true);
        }
        info!(data_source = %descriptor.id(), name = %descriptor.name(), "Added data source");
        self.shared.notify(RegistryEvent::Added {
            id: descriptor.id().to_string(),
        });
        self.flush_config();
        Ok(descriptor)
    }

    /// Announces a settings change and schedules a save.
    ///
    /// # Errors
    /// Returns error if the id is unknown
    pub fn update_data_source(&self, id: &str) -> Result<()> {
        let descriptor = self
            .data_source(id)
            .ok_or_else(|| RegistryError::not_found("data source", id))?;
        if let Some(folder) = descriptor.settings().folder {
            self.find_folder_by_path(&folder, true);
        }
        self.shared.notify(RegistryEvent::Updated { id: id.to_string() });
        self.flush_config();
        Ok(())
    }

    /// Removes a descriptor: disconnects it, deletes its secrets and
    /// schedules a save. Returns false if the id is unknown.
    pub async fn remove_data_source(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.write();
            state
                .data_sources
                .iter()
                .position(|d| d.id() == id)
                .map(|index| state.data_sources.remove(index))
        };
        let Some(descriptor) = removed else {
            return false;
        };
        self.detach_descriptor(&descriptor).await;
        self.shared
            .delete_secrets(&[data_source_key(self.shared.project_id(), id)])
            .await;
        info!(data_source = id, "Removed data source");
        self.flush_config();
        true
    }

    async fn detach_descriptor(&self, descriptor: &DataSourceDescriptor) {
        if !descriptor.disconnect().await {
            warn!(data_source = %descriptor.id(), "Removed data source is still busy");
        }
        self.shared.notify(RegistryEvent::Removed {
            id: descriptor.id().to_string(),
        });
    }

    /// Moves a descriptor to `folder` (created when missing).
    ///
    /// # Errors
    /// Returns error if the id is unknown
    pub fn move_to_folder(&self, id: &str, folder: Option<&str>) -> Result<()> {
        let descriptor = self
            .data_source(id)
            .ok_or_else(|| RegistryError::not_found("data source", id))?;
        if let Some(folder) = folder {
            self.find_folder_by_path(folder, true);
        }
        descriptor.update_settings(|s| s.folder = folder.map(str::to_string));
        self.shared.notify(RegistryEvent::Updated { id: id.to_string() });
        self.flush_config();
        Ok(())
    }

    /// Clears a descriptor's saved credentials: disables password saving,
    /// drops in-memory secrets and deletes them from the secret store.
    ///
    /// # Errors
    /// Returns error if the id is unknown or the save fails
    pub async fn clear_saved_credentials(&self, id: &str) -> Result<()> {
        let descriptor = self
            .data_source(id)
            .ok_or_else(|| RegistryError::not_found("data source", id))?;
        descriptor.resolve_secrets_if_needed().await;
        descriptor.update_settings(|s| {
            s.save_password = false;
            s.connection.clear_secrets();
        });
        self.shared
            .delete_secrets(&[data_source_key(self.shared.project_id(), id)])
            .await;
        self.shared.notify(RegistryEvent::Updated { id: id.to_string() });
        self.save_now().await
    }

    // Folders

    /// All folders.
    pub fn folders(&self) -> Vec<DataSourceFolder> {
        self.shared.state.read().folders.clone()
    }

    /// Folder by path; with `create`, missing folders along the path are
    /// created.
    pub fn find_folder_by_path(&self, path: &str, create: bool) -> Option<DataSourceFolder> {
        let mut created = Vec::new();
        let found = {
            let mut state = self.shared.state.write();
            if let Some(folder) = state.folders.iter().find(|f| f.path() == path) {
                return Some(folder.clone());
            }
            if !create || path.is_empty() {
                return None;
            }
            let mut parent: Option<String> = None;
            let mut last = None;
            for name in path.split(FOLDER_PATH_SEPARATOR).filter(|n| !n.is_empty()) {
                let folder = DataSourceFolder::new(name, parent.clone());
                let folder_path = folder.path();
                if !state.folders.iter().any(|f| f.path() == folder_path) {
                    state.folders.push(folder.clone());
                    created.push(folder_path.clone());
                }
                last = state.folders.iter().find(|f| f.path() == folder_path).cloned();
                parent = Some(folder_path);
            }
            last
        };
        for path in created {
            debug!(folder = %path, "Created folder");
            self.shared.notify(RegistryEvent::FolderChanged { path });
        }
        found
    }

    /// Adds a folder under `parent`.
    ///
    /// # Errors
    /// Returns error if the name is empty or contains the path separator,
    /// the parent does not exist, or the folder already exists
    pub fn add_folder(&self, name: &str, parent: Option<&str>) -> Result<DataSourceFolder> {
        if name.is_empty() || name.contains(FOLDER_PATH_SEPARATOR) {
            return Err(RegistryError::configuration(format!("Invalid folder name '{}'", name)));
        }
        let folder = DataSourceFolder::new(name, parent.map(str::to_string));
        {
            let mut state = self.shared.state.write();
            if let Some(parent) = parent
                && !state.folders.iter().any(|f| f.path() == parent)
            {
                return Err(RegistryError::not_found("folder", parent));
            }
            if state.folders.iter().any(|f| f.path() == folder.path()) {
                return Err(RegistryError::configuration(format!(
                    "Folder '{}' already exists",
                    folder.path()
                )));
            }
            state.folders.push(folder.clone());
        }
        self.shared.notify(RegistryEvent::FolderChanged { path: folder.path() });
        self.flush_config();
        Ok(folder)
    }

    /// Sets a folder's description.
    ///
    /// # Errors
    /// Returns error if the folder does not exist
    pub fn update_folder_description(&self, path: &str, description: Option<String>) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            let folder = state
                .folders
                .iter_mut()
                .find(|f| f.path() == path)
                .ok_or_else(|| RegistryError::not_found("folder", path))?;
            folder.description = description;
        }
        self.shared.notify(RegistryEvent::FolderChanged { path: path.to_string() });
        self.flush_config();
        Ok(())
    }

    /// Removes a folder.
    ///
    /// With `drop_contents` the whole subtree goes, data sources included.
    /// Otherwise subfolders and data sources move up to the removed
    /// folder's parent. Returns false if the folder does not exist.
    pub async fn remove_folder(&self, path: &str, drop_contents: bool) -> bool {
        let (removed_sources, moved_sources) = {
            let mut state = self.shared.state.write();
            let Some(index) = state.folders.iter().position(|f| f.path() == path) else {
                return false;
            };
            let removed = state.folders.remove(index);
            let new_parent = removed.parent.as_deref();

            if drop_contents {
                state
                    .folders
                    .retain(|f| rebase_path(&f.path(), path, None).is_none());
                let (dropped, kept): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut state.data_sources)
                        .into_iter()
                        .partition(|d| {
                            d.settings()
                                .folder
                                .is_some_and(|folder| rebase_path(&folder, path, None).is_some())
                        });
                state.data_sources = kept;
                (dropped, Vec::new())
            } else {
                for folder in &mut state.folders {
                    if let Some(parent) = folder.parent.clone()
                        && let Some(rebased) = rebase_path(&parent, path, new_parent)
                    {
                        folder.parent = rebased;
                    }
                }
                let mut moved = Vec::new();
                for descriptor in &state.data_sources {
                    let folder = descriptor.settings().folder;
                    if let Some(rebased) = folder.and_then(|f| rebase_path(&f, path, new_parent)) {
                        descriptor.update_settings(|s| s.folder = rebased);
                        moved.push(descriptor.id().to_string());
                    }
                }
                (Vec::new(), moved)
            }
        };

        for descriptor in &removed_sources {
            self.detach_descriptor(descriptor).await;
        }
        let keys: Vec<String> = removed_sources
            .iter()
            .map(|d| data_source_key(self.shared.project_id(), d.id()))
            .collect();
        self.shared.delete_secrets(&keys).await;
        for id in moved_sources {
            self.shared.notify(RegistryEvent::Updated { id });
        }
        info!(folder = path, drop_contents, "Removed folder");
        self.shared.notify(RegistryEvent::FolderChanged { path: path.to_string() });
        self.flush_config();
        true
    }

    // Profiles, filters and external configurations

    /// Network profiles.
    pub fn network_profiles(&self) -> Vec<NetworkProfile> {
        self.shared.state.read().network_profiles.clone()
    }

    /// Network profile by name.
    pub fn network_profile(&self, name: &str) -> Option<NetworkProfile> {
        self.shared.network_profile(name)
    }

    /// Adds or replaces a network profile (matched by name).
    pub fn update_network_profile(&self, profile: NetworkProfile) {
        {
            let mut state = self.shared.state.write();
            match state.network_profiles.iter_mut().find(|p| p.name == profile.name) {
                Some(existing) => *existing = profile,
                None => state.network_profiles.push(profile),
            }
        }
        self.flush_config();
    }

    /// Removes a network profile and its secrets.
    pub async fn remove_network_profile(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.write();
            state
                .network_profiles
                .iter()
                .position(|p| p.name == name)
                .map(|index| state.network_profiles.remove(index))
        };
        let Some(profile) = removed else {
            return false;
        };
        let keys: Vec<String> = profile
            .handlers
            .iter()
            .map(|h| network_profile_handler_key(self.shared.project_id(), name, &h.id))
            .collect();
        self.shared.delete_secrets(&keys).await;
        self.flush_config();
        true
    }

    /// Auth profiles.
    pub fn auth_profiles(&self) -> Vec<AuthProfile> {
        self.shared.state.read().auth_profiles.clone()
    }

    /// Auth profile by id.
    pub fn auth_profile(&self, id: &str) -> Option<AuthProfile> {
        self.shared.auth_profile(id)
    }

    /// Adds or replaces an auth profile (matched by id).
    pub fn update_auth_profile(&self, profile: AuthProfile) {
        {
            let mut state = self.shared.state.write();
            match state.auth_profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(existing) => *existing = profile,
                None => state.auth_profiles.push(profile),
            }
        }
        self.flush_config();
    }

    /// Removes an auth profile and its secrets.
    pub async fn remove_auth_profile(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.write();
            let before = state.auth_profiles.len();
            state.auth_profiles.retain(|p| p.id != id);
            before != state.auth_profiles.len()
        };
        if removed {
            self.shared
                .delete_secrets(&[auth_profile_key(self.shared.project_id(), id)])
                .await;
            self.flush_config();
        }
        removed
    }

    /// Saved filters.
    pub fn saved_filters(&self) -> Vec<ObjectFilter> {
        self.shared.state.read().saved_filters.clone()
    }

    /// Adds or replaces a saved filter (matched by name).
    pub fn update_saved_filter(&self, filter: ObjectFilter) {
        {
            let mut state = self.shared.state.write();
            let existing = filter
                .name
                .as_ref()
                .and_then(|name| state.saved_filters.iter().position(|f| f.name.as_ref() == Some(name)));
            match existing {
                Some(index) => state.saved_filters[index] = filter,
                None => state.saved_filters.push(filter),
            }
        }
        self.flush_config();
    }

    /// Removes a saved filter by name.
    pub fn remove_saved_filter(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.write();
            let before = state.saved_filters.len();
            state.saved_filters.retain(|f| f.name.as_deref() != Some(name));
            before != state.saved_filters.len()
        };
        if removed {
            self.flush_config();
        }
        removed
    }

    /// Opaque external configuration by id.
    pub fn external_configuration(&self, id: &str) -> Option<Value> {
        self.shared.state.read().external_configurations.get(id).cloned()
    }

    /// Sets or (with `None`) removes an external configuration.
    pub fn set_external_configuration(&self, id: &str, value: Option<Value>) {
        {
            let mut state = self.shared.state.write();
            match value {
                Some(value) => {
                    state.external_configurations.insert(id.to_string(), value);
                }
                None => {
                    state.external_configurations.remove(id);
                }
            }
        }
        self.flush_config();
    }
}

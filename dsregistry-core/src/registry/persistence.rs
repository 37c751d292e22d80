//! Loading, reconciling and saving configuration storages.

use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use super::{DataSourceRegistry, RegistryEvent, RegistryShared};
use crate::Result;
use crate::descriptor::{DataSourceDescriptor, apply_handler_record};
use crate::model::{AuthProfile, DataSourceOrigin, DataSourceSettings, NetworkProfile};
use crate::secrets::{auth_profile_key, network_profile_handler_key, read_record};
use crate::serializer::{
    DataSourceSecrets, DataSourceSnapshot, ModernSerializer, ParseContext, ParsedConfiguration, ParsedDataSource,
    DataSourceSerializer, SaveData, SecretsMode, serializer_for,
};
use crate::storage::{
    ConfigurationStorage, read_optional, remove_if_exists, scan_storages, write_atomic,
};

/// Parallel disconnects on dispose.
const DISPOSE_CONCURRENCY: usize = 8;

/// What a storage parse changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Ids of new descriptors
    pub added: Vec<String>,
    /// Ids whose settings changed
    pub updated: Vec<String>,
    /// Ids whose settings were already current
    pub untouched: Vec<String>,
    /// Ids purged because the file no longer has them
    pub removed: Vec<String>,
}

impl ParseOutcome {
    /// True if any descriptor was added, updated or removed.
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Result of loading a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Storages parsed
    pub storages: usize,
    /// Descriptors in the registry afterwards
    pub data_sources: usize,
    /// Legacy XML files were converted to JSON
    pub migrated: bool,
    /// Per-storage outcome, keyed by storage id
    pub outcomes: BTreeMap<String, ParseOutcome>,
}

/// Copies secret values of `from` into `into` where `into` has none.
/// Keeps a reload from looking like a change when the file simply does
/// not carry secrets.
fn carry_secrets(from: &DataSourceSettings, into: &mut DataSourceSettings) {
    let source = &from.connection;
    let target = &mut into.connection;
    if target.user_name.is_none() {
        target.user_name.clone_from(&source.user_name);
    }
    if target.user_password.is_none() {
        target.user_password.clone_from(&source.user_password);
    }
    for (name, value) in &source.secure_auth_properties {
        target
            .secure_auth_properties
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }
    for handler in &source.handlers {
        if let Some(existing) = target.handler_mut(&handler.id) {
            if existing.user_name.is_none() {
                existing.user_name.clone_from(&handler.user_name);
            }
            if existing.password.is_none() {
                existing.password.clone_from(&handler.password);
            }
            for (name, value) in &handler.secure_properties {
                existing
                    .secure_properties
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// Descriptors that a file may add, replace or purge.
fn is_file_backed(descriptor: &DataSourceDescriptor) -> bool {
    !descriptor.is_provided()
        && !descriptor.is_detached()
        && !matches!(descriptor.origin(), DataSourceOrigin::External { .. })
}

impl RegistryShared {
    fn parse_context<'a>(&'a self, credentials: Option<&'a [u8]>) -> ParseContext<'a> {
        ParseContext {
            drivers: &self.services.drivers,
            network_handlers: &self.services.network_handlers,
            encryptor: self.services.encryptor.as_ref(),
            credentials,
            secrets_mode: self.secrets_mode,
        }
    }

    fn remember_storage(&self, storage: &ConfigurationStorage) {
        let mut state = self.state.write();
        if !state.storages.contains(storage) {
            state.storages.push(storage.clone());
        }
    }

    /// Loads every storage of the project.
    pub(crate) async fn load(self: &Arc<Self>) -> Result<LoadSummary> {
        self.password_read_canceled.store(false, Ordering::Release);
        let metadata_dir = self.config.metadata_dir();
        let scan = scan_storages(&self.config.project_root, &metadata_dir).await?;
        self.remember_storage(&self.config.default_storage());

        let migrate = scan.modern.is_empty() && !scan.legacy.is_empty();
        let storages = if migrate { scan.legacy } else { scan.modern };

        let mut summary = LoadSummary {
            migrated: migrate,
            ..LoadSummary::default()
        };
        for storage in &storages {
            match self.parse_storage(storage, None, false).await {
                Ok(outcome) => {
                    summary.outcomes.insert(storage.storage_id().to_string(), outcome);
                    summary.storages += 1;
                }
                Err(e) if storage.is_default() => return Err(e),
                Err(e) => {
                    error!(storage = %storage, error = %e, "Cannot load configuration storage");
                }
            }
        }

        if migrate {
            info!(files = storages.len(), "Converting legacy configuration");
            self.save_now().await?;
        }

        summary.data_sources = self.state.read().data_sources.len();
        info!(
            project = %self.config.project_id,
            storages = summary.storages,
            data_sources = summary.data_sources,
            "Loaded data sources"
        );
        Ok(summary)
    }

    /// Parses one storage and reconciles the result with the live
    /// descriptors.
    ///
    /// With `ids_filter`, only the listed data sources are touched. With
    /// `purge_untouched`, descriptors of this storage missing from the
    /// file are removed.
    pub(crate) async fn parse_storage(
        self: &Arc<Self>,
        storage: &ConfigurationStorage,
        ids_filter: Option<&HashSet<String>>,
        purge_untouched: bool,
    ) -> Result<ParseOutcome> {
        let mut outcome = ParseOutcome::default();
        let Some(content) = read_optional(storage.path()).await? else {
            debug!(storage = %storage, "Configuration file not found");
            if storage.is_default() {
                self.remember_storage(storage);
            }
            if purge_untouched {
                self.purge(storage, &HashSet::new(), ids_filter, &mut outcome).await;
            }
            return Ok(outcome);
        };
        let credentials = match storage.credentials_path() {
            Some(path) => read_optional(&path).await?,
            None => None,
        };

        let ctx = self.parse_context(credentials.as_deref());
        let parsed = serializer_for(storage).parse_data_sources(storage, &content, &ctx)?;
        if !storage.is_legacy() {
            self.remember_storage(storage);
        }

        let ParsedConfiguration {
            folders,
            data_sources,
            network_profiles,
            auth_profiles,
            saved_filters,
            connection_types,
            external_configurations,
            profile_secrets_resolved,
        } = parsed;

        let (network_profiles, auth_profiles) = if profile_secrets_resolved {
            (network_profiles, auth_profiles)
        } else {
            self.resolve_profile_secrets(network_profiles, auth_profiles).await
        };

        for connection_type in connection_types {
            self.connection_types.update_connection_type(connection_type);
        }
        {
            let mut state = self.state.write();
            for folder in folders {
                match state.folders.iter_mut().find(|f| f.path() == folder.path()) {
                    Some(existing) => existing.description = folder.description,
                    None => state.folders.push(folder),
                }
            }
            for profile in network_profiles {
                match state.network_profiles.iter_mut().find(|p| p.name == profile.name) {
                    Some(existing) => *existing = profile,
                    None => state.network_profiles.push(profile),
                }
            }
            for profile in auth_profiles {
                match state.auth_profiles.iter_mut().find(|p| p.id == profile.id) {
                    Some(existing) => *existing = profile,
                    None => state.auth_profiles.push(profile),
                }
            }
            for filter in saved_filters {
                let existing = filter.name.as_ref().and_then(|name| {
                    state
                        .saved_filters
                        .iter()
                        .position(|f| f.name.as_ref() == Some(name))
                });
                match existing {
                    Some(index) => state.saved_filters[index] = filter,
                    None => state.saved_filters.push(filter),
                }
            }
            state.external_configurations.extend(external_configurations);
        }

        let mut seen = HashSet::new();
        for parsed in data_sources {
            if ids_filter.is_some_and(|ids| !ids.contains(&parsed.id)) {
                continue;
            }
            seen.insert(parsed.id.clone());
            self.reconcile(storage, parsed, &mut outcome).await;
        }

        if purge_untouched {
            self.purge(storage, &seen, ids_filter, &mut outcome).await;
        }

        debug!(
            storage = %storage,
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            untouched = outcome.untouched.len(),
            removed = outcome.removed.len(),
            "Parsed configuration storage"
        );
        Ok(outcome)
    }

    async fn reconcile(self: &Arc<Self>, storage: &ConfigurationStorage, parsed: ParsedDataSource, outcome: &mut ParseOutcome) {
        let ParsedDataSource {
            id,
            origin,
            mut settings,
            virtual_model,
            secrets_resolved,
            plaintext_credentials,
        } = parsed;

        if let Some(existing) = self.data_source(&id) {
            if !secrets_resolved && existing.is_secrets_resolved() {
                carry_secrets(&existing.settings(), &mut settings);
            }
            let changed = existing.settings() != settings || existing.virtual_model() != virtual_model;
            if changed {
                existing.replace_settings(settings);
                existing.set_virtual_model(virtual_model);
                debug!(data_source = %id, "Data source changed on disk");
                self.notify(RegistryEvent::Updated { id: id.clone() });
                outcome.updated.push(id);
            } else {
                outcome.untouched.push(id);
            }
            return;
        }

        let mut descriptor = DataSourceDescriptor::new(&id, storage.clone(), origin, settings, Arc::downgrade(self))
            .with_virtual_model(virtual_model)
            .with_secrets_resolved(secrets_resolved);
        if plaintext_credentials
            && self.secrets_mode == SecretsMode::Controller
            && !descriptor.resolve_secrets_from(self, true).await
        {
            // Plaintext values from the file move into the store on the next save
            descriptor = descriptor.with_secrets_resolved(true);
        }
        let inserted = {
            let mut state = self.state.write();
            let taken = state.data_sources.iter().any(|d| d.id() == id);
            if !taken {
                state.data_sources.push(Arc::new(descriptor));
            }
            !taken
        };
        if inserted {
            self.notify(RegistryEvent::Added { id: id.clone() });
            outcome.added.push(id);
        } else {
            // Another parse of the same file registered it while secrets were read
            debug!(data_source = %id, "Data source registered concurrently, keeping the existing one");
            outcome.untouched.push(id);
        }
    }

    async fn purge(
        &self,
        storage: &ConfigurationStorage,
        seen: &HashSet<String>,
        ids_filter: Option<&HashSet<String>>,
        outcome: &mut ParseOutcome,
    ) {
        let same_storage = |d: &DataSourceDescriptor| {
            d.storage() == storage
                || (storage.is_legacy() && d.storage() == &storage.modern_counterpart(&self.config.metadata_dir()))
        };
        let removed: Vec<Arc<DataSourceDescriptor>> = {
            let mut state = self.state.write();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.data_sources)
                .into_iter()
                .partition(|d| {
                    is_file_backed(d)
                        && same_storage(d)
                        && !seen.contains(d.id())
                        && ids_filter.is_none_or(|ids| ids.contains(d.id()))
                });
            state.data_sources = kept;
            gone
        };
        for descriptor in removed {
            if !descriptor.disconnect().await {
                warn!(data_source = %descriptor.id(), "Purged data source is still busy");
            }
            info!(data_source = %descriptor.id(), storage = %storage, "Data source removed on disk");
            self.notify(RegistryEvent::Removed {
                id: descriptor.id().to_string(),
            });
            outcome.removed.push(descriptor.id().to_string());
        }
    }

    /// Reads one data source's secrets back from the credentials file of
    /// its storage.
    pub(crate) async fn read_file_secrets(
        &self,
        storage: &ConfigurationStorage,
        ds_id: &str,
        handler_ids: &[String],
    ) -> Result<DataSourceSecrets> {
        let storage = if storage.is_legacy() {
            storage.modern_counterpart(&self.config.metadata_dir())
        } else {
            storage.clone()
        };
        let Some(path) = storage.credentials_path() else {
            return Ok((None, Vec::new()));
        };
        match read_optional(&path).await? {
            Some(bytes) => ModernSerializer::read_data_source_secrets(
                &bytes,
                self.services.encryptor.as_ref(),
                ds_id,
                handler_ids,
            ),
            None => Ok((None, Vec::new())),
        }
    }

    async fn resolve_profile_secrets(
        &self,
        mut network_profiles: Vec<NetworkProfile>,
        mut auth_profiles: Vec<AuthProfile>,
    ) -> (Vec<NetworkProfile>, Vec<AuthProfile>) {
        let Some(controller) = self.secret_controller() else {
            return (network_profiles, auth_profiles);
        };
        let project_id = self.project_id();
        for profile in &mut network_profiles {
            for handler in &mut profile.handlers {
                if self.password_read_canceled() {
                    break;
                }
                let key = network_profile_handler_key(project_id, &profile.name, &handler.id);
                match read_record(controller.as_ref(), &key).await {
                    Ok(Some(record)) => apply_handler_record(handler, record, false),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(profile = %profile.name, handler = %handler.id, error = %e, "Cannot read profile secrets");
                        self.cancel_password_reads();
                    }
                }
            }
        }
        for profile in &mut auth_profiles {
            if self.password_read_canceled() {
                break;
            }
            match read_record(controller.as_ref(), &auth_profile_key(project_id, &profile.id)).await {
                Ok(Some(record)) => {
                    if record.user.is_some() {
                        profile.user_name = record.user;
                    }
                    if profile.save_password && record.password.is_some() {
                        profile.user_password = record.password;
                    }
                    profile.properties.extend(record.properties);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(profile = %profile.id, error = %e, "Cannot read auth profile secrets");
                    self.cancel_password_reads();
                }
            }
        }
        (network_profiles, auth_profiles)
    }

    /// Writes every storage now.
    pub(crate) async fn save_now(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        self.save_in_progress.store(true, Ordering::Release);
        let result = self.save_all().await;
        self.save_in_progress.store(false, Ordering::Release);
        result
    }

    async fn save_all(&self) -> Result<()> {
        let metadata_dir = self.config.metadata_dir();
        let default_storage = self.config.default_storage();

        let (mut targets, descriptors, folders, network_profiles, auth_profiles, saved_filters, external) = {
            let state = self.state.read();
            (
                state.storages.clone(),
                state.data_sources.clone(),
                state.folders.clone(),
                state.network_profiles.clone(),
                state.auth_profiles.clone(),
                state.saved_filters.clone(),
                state.external_configurations.clone(),
            )
        };

        let mut grouped: BTreeMap<String, Vec<DataSourceSnapshot>> = BTreeMap::new();
        for descriptor in descriptors.iter().filter(|d| !d.is_provided() && !d.is_detached()) {
            let storage = if descriptor.storage().is_legacy() {
                descriptor.storage().modern_counterpart(&metadata_dir)
            } else {
                descriptor.storage().clone()
            };
            if !targets.contains(&storage) {
                targets.push(storage.clone());
            }
            grouped
                .entry(storage.storage_id().to_string())
                .or_default()
                .push(descriptor.snapshot());
        }
        if !targets.contains(&default_storage) {
            targets.push(default_storage);
        }

        let connection_types = self.connection_types.persistable_types();
        let custom_drivers = self.services.drivers.custom_drivers();
        let mut emptied = Vec::new();
        let mut written = Vec::new();

        for storage in &targets {
            let snapshots = grouped.remove(storage.storage_id()).unwrap_or_default();
            if snapshots.is_empty() && !storage.is_default() {
                self.delete_storage_files(storage).await?;
                emptied.push(storage.clone());
                continue;
            }
            let project_wide = storage.is_default();
            let previous_credentials = match (self.secrets_mode, storage.credentials_path()) {
                (SecretsMode::CredentialsFile, Some(path)) => read_optional(&path).await?,
                _ => None,
            };
            let data = SaveData {
                project_id: self.project_id(),
                data_sources: &snapshots,
                folders: &folders,
                network_profiles: if project_wide { &network_profiles } else { &[] },
                auth_profiles: if project_wide { &auth_profiles } else { &[] },
                saved_filters: if project_wide { &saved_filters } else { &[] },
                connection_types: if project_wide { &connection_types } else { &[] },
                custom_drivers: if project_wide { &custom_drivers } else { &[] },
                external_configurations: &external,
                secrets_mode: self.secrets_mode,
                encryptor: self.services.encryptor.as_ref(),
                encrypt_project: self.config.encrypt_project,
                previous_credentials: previous_credentials.as_deref(),
            };
            self.write_storage(storage, &data).await?;
            written.push(storage.clone());
        }

        {
            let mut state = self.state.write();
            state.storages.retain(|s| !emptied.contains(s));
            for storage in written {
                if !state.storages.contains(&storage) {
                    state.storages.push(storage);
                }
            }
        }
        if let Some(controller) = self.secret_controller() {
            controller.flush().await?;
        }
        Ok(())
    }

    async fn write_storage(&self, storage: &ConfigurationStorage, data: &SaveData<'_>) -> Result<()> {
        let saved = ModernSerializer.save_data_sources(storage, data)?;

        if self.config.backup_on_save
            && let Some(previous) = read_optional(storage.path()).await?
            && previous != saved.config
        {
            let backup = storage.backup_path();
            if let Err(e) = tokio::fs::write(&backup, &previous).await {
                warn!(path = %backup.display(), error = %e, "Cannot write configuration backup");
            }
        }
        write_atomic(storage.path(), &saved.config).await?;

        if let Some(path) = storage.credentials_path().filter(|_| !saved.keep_credentials) {
            match &saved.credentials {
                Some(bytes) => write_atomic(&path, bytes).await?,
                None => {
                    remove_if_exists(&path).await?;
                }
            }
        }

        if let Some(controller) = self.secret_controller() {
            for update in saved.secrets {
                controller.set(&update.key, update.value).await?;
            }
        }
        debug!(storage = %storage, data_sources = data.data_sources.len(), "Saved configuration storage");
        Ok(())
    }

    async fn delete_storage_files(&self, storage: &ConfigurationStorage) -> Result<()> {
        let removed = remove_if_exists(storage.path()).await?;
        if let Some(path) = storage.credentials_path() {
            remove_if_exists(&path).await?;
        }
        if removed {
            info!(storage = %storage, "Deleted empty configuration storage");
        }
        Ok(())
    }

    /// Schedules a save after the configured delay; saves requested in the
    /// meantime coalesce into it.
    pub(crate) fn flush_config(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, configuration save skipped");
            return;
        };
        if self
            .save_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.save_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.save_scheduled.store(false, Ordering::Release);
            if shared.disposed.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = shared.save_now().await {
                error!(project = %shared.config.project_id, error = %e, "Cannot save data sources");
            }
        });
    }

    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let descriptors: Vec<_> = self.state.read().data_sources.clone();
        let connected: Vec<_> = descriptors.into_iter().filter(|d| d.is_connected()).collect();
        if !connected.is_empty() {
            info!(count = connected.len(), "Closing connections");
            let closing = futures::stream::iter(connected)
                .map(|d| async move {
                    if !d.disconnect().await {
                        warn!(data_source = %d.id(), "Data source busy during shutdown");
                    }
                })
                .buffer_unordered(DISPOSE_CONCURRENCY)
                .collect::<Vec<()>>();
            if tokio::time::timeout(self.config.shutdown_timeout, closing).await.is_err() {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis(),
                    "Timed out closing connections"
                );
            }
        }
        self.listeners.clear();
        debug!(project = %self.config.project_id, "Registry disposed");
    }
}

impl DataSourceRegistry {
    /// Loads the project's configuration files.
    ///
    /// JSON storages in the metadata folder are parsed in order, default
    /// first. When the project only has legacy XML files, those are parsed
    /// and written back as JSON; the XML files are left in place.
    ///
    /// # Errors
    /// Returns error if the default storage cannot be read or decoded, or
    /// the migration save fails. Other storages that fail are logged and
    /// skipped.
    pub async fn load(&self) -> Result<LoadSummary> {
        self.shared.load().await
    }

    /// Re-reads every known storage and drops descriptors whose entries
    /// disappeared. Skipped (returns `None`) while a save is running.
    ///
    /// # Errors
    /// Returns error if a storage cannot be read or decoded
    pub async fn reload(&self) -> Result<Option<LoadSummary>> {
        if self.save_in_progress() {
            debug!("Save in progress, reload skipped");
            return Ok(None);
        }
        let storages = self.shared.state.read().storages.clone();
        let mut summary = LoadSummary::default();
        for storage in &storages {
            let outcome = self.shared.parse_storage(storage, None, true).await?;
            summary.outcomes.insert(storage.storage_id().to_string(), outcome);
            summary.storages += 1;
        }
        summary.data_sources = self.shared.state.read().data_sources.len();
        Ok(Some(summary))
    }

    /// Parses one storage and reconciles it with the live descriptors.
    ///
    /// # Arguments
    /// * `storage` - File to read
    /// * `ids_filter` - Restrict the update to these data sources
    /// * `purge_untouched` - Remove descriptors of this storage that the
    ///   file no longer contains (provided and external ones are kept)
    ///
    /// # Errors
    /// Returns error if the file cannot be read or decoded
    pub async fn parse_storage(
        &self,
        storage: &ConfigurationStorage,
        ids_filter: Option<&HashSet<String>>,
        purge_untouched: bool,
    ) -> Result<ParseOutcome> {
        self.shared.parse_storage(storage, ids_filter, purge_untouched).await
    }

    /// Writes all storages immediately.
    ///
    /// # Errors
    /// Returns error if a file or secret cannot be written
    pub async fn save_now(&self) -> Result<()> {
        self.shared.save_now().await
    }

    /// Schedules a debounced save. Without a running async runtime nothing
    /// is scheduled; call [`save_now`](Self::save_now) instead.
    pub fn flush_config(&self) {
        self.shared.flush_config();
    }

    /// True while a save is writing files.
    pub fn save_in_progress(&self) -> bool {
        self.shared.save_in_progress.load(Ordering::Acquire)
    }

    /// Known storages of the project.
    pub fn storages(&self) -> Vec<ConfigurationStorage> {
        self.shared.state.read().storages.clone()
    }

    /// Shuts the registry down: disconnects every data source within the
    /// shutdown timeout and drops all listeners. Pending debounced saves
    /// are abandoned.
    pub async fn dispose(&self) {
        self.shared.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::model::{ConnectionConfiguration, DriverDescriptor, NetworkHandlerConfiguration, NetworkHandlerType};
    use crate::registry::RegistryServices;
    use std::time::Duration;

    fn builtin_driver() -> Arc<DriverDescriptor> {
        crate::provider::DriverRegistry::builtin().resolve_driver("postgresql", "postgres-jdbc")
    }

    fn settings(password: Option<&str>) -> DataSourceSettings {
        settings_with(builtin_driver(), password)
    }

    fn settings_with(driver: Arc<DriverDescriptor>, password: Option<&str>) -> DataSourceSettings {
        let mut connection = ConnectionConfiguration::new("db.local");
        connection.user_name = Some("scott".to_string());
        connection.user_password = password.map(str::to_string);
        DataSourceSettings::new("Sales", driver, connection)
    }

    #[test]
    fn test_carry_secrets_fills_only_missing() {
        let mut from = settings(Some("tiger"));
        let mut handler = NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel);
        handler.password = Some("hunter2".to_string());
        from.connection.handlers.push(handler.clone());

        let mut into = settings(None);
        handler.password = None;
        into.connection.handlers.push(handler);
        carry_secrets(&from, &mut into);
        assert_eq!(into, from);

        let mut explicit = settings(Some("other"));
        carry_secrets(&from, &mut explicit);
        assert_eq!(explicit.connection.user_password.as_deref(), Some("other"));
    }

    #[test]
    fn test_parse_outcome_changed() {
        let mut outcome = ParseOutcome::default();
        assert!(!outcome.changed());
        outcome.untouched.push("a".to_string());
        assert!(!outcome.changed());
        outcome.removed.push("b".to_string());
        assert!(outcome.changed());
    }

    #[tokio::test]
    async fn test_save_and_reload_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path()).with_save_delay(Duration::from_millis(10));
        let registry = DataSourceRegistry::new(config.clone(), RegistryServices::new()).unwrap();
        registry
            .add_data_source(registry.new_data_source_with_id("pg-1", settings(Some("tiger"))))
            .unwrap();
        registry.save_now().await.unwrap();

        let summary = registry.reload().await.unwrap().unwrap();
        let outcome = &summary.outcomes["data-sources.json"];
        assert_eq!(outcome.untouched, ["pg-1"]);
        assert!(!outcome.changed());

        let fresh = DataSourceRegistry::open(config, RegistryServices::new()).await.unwrap();
        let ds = fresh.data_source("pg-1").unwrap();
        assert_eq!(ds.settings().connection.user_password.as_deref(), Some("tiger"));
        registry.dispose().await;
        fresh.dispose().await;
    }

    #[tokio::test]
    async fn test_debounced_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path()).with_save_delay(Duration::from_millis(10));
        let path = config.default_storage().path().to_path_buf();
        let registry = DataSourceRegistry::new(config, RegistryServices::new()).unwrap();
        registry
            .add_data_source(registry.new_data_source_with_id("pg-1", settings(None)))
            .unwrap();

        let mut written = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if path.exists() && !registry.save_in_progress() {
                written = true;
                break;
            }
        }
        assert!(written);
        registry.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_parses_register_each_id_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path()).with_save_delay(Duration::from_millis(10));
        let writer = DataSourceRegistry::new(config.clone(), RegistryServices::new()).unwrap();
        for id in ["pg-1", "pg-2", "pg-3"] {
            writer
                .add_data_source(writer.new_data_source_with_id(id, settings(Some("tiger"))))
                .unwrap();
        }
        writer.save_now().await.unwrap();
        writer.dispose().await;

        let registry = DataSourceRegistry::new(config, RegistryServices::new()).unwrap();
        let storage = registry.config().default_storage();
        let (first, second) = tokio::join!(
            registry.parse_storage(&storage, None, false),
            registry.parse_storage(&storage, None, false)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.added.len() + second.added.len(), 3);

        let mut ids: Vec<String> = registry.data_sources().iter().map(|d| d.id().to_string()).collect();
        ids.sort();
        assert_eq!(ids, ["pg-1", "pg-2", "pg-3"]);
        registry.dispose().await;
    }

    #[tokio::test]
    async fn test_empty_secondary_storage_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path());
        let team = ConfigurationStorage::modern(&config.metadata_dir(), "-team");
        let registry = DataSourceRegistry::new(config, RegistryServices::new()).unwrap();

        let ds = DataSourceDescriptor::new(
            "pg-team",
            team.clone(),
            DataSourceOrigin::Local,
            settings(None),
            Arc::downgrade(&registry.shared),
        );
        registry.add_data_source(ds).unwrap();
        registry.save_now().await.unwrap();
        assert!(team.path().exists());

        assert!(registry.remove_data_source("pg-team").await);
        registry.save_now().await.unwrap();
        assert!(!team.path().exists());
        assert!(registry.config().default_storage().path().exists());
        registry.dispose().await;
    }
}

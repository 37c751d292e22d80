//! Modern `data-sources*.json` format.
//!
//! Secrets never appear in the configuration object. Depending on the
//! [`SecretsMode`] they are emitted as secret controller writes or collected
//! into the credentials map `{topNode: {subNode: {prop: value}}}`, which is
//! stored (encrypted when a project key exists) next to the configuration.
//!
//! Sections owned by the whole project (folders, profiles, saved filters,
//! connection types, custom drivers, external configurations) are only
//! written to the default storage.

use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::json::{self, Object, ObjectWriter};
use super::{
    DataSourceSerializer, DataSourceSnapshot, ParseContext, ParsedConfiguration,
    ParsedDataSource, SaveData, SavedConfiguration, SecretUpdate, SecretsMode,
};
use crate::Result;
use crate::error::RegistryError;
use crate::model::{
    AuthProfile, ConnectionBootstrap, ConnectionConfiguration, ConnectionEventType,
    ConnectionType, DataSourceFolder, DataSourceOrigin, DataSourcePermission,
    DataSourceSettings, DriverDescriptor, NavigatorSettings, NetworkHandlerConfiguration,
    NetworkProfile, ObjectFilter, ShellCommand, VirtualModel, split_folder_path,
};
use crate::secrets::{
    SecretRecord, auth_profile_key, data_source_handler_key, data_source_key,
    network_profile_handler_key,
};
use crate::security::encryption::ValueEncryptor;
use crate::storage::ConfigurationStorage;

const NODE_CONNECTION: &str = "#connection";
const ATTR_USER: &str = "user";
const ATTR_PASSWORD: &str = "password";

fn profile_node(profile: &str) -> String {
    format!("profile:{}", profile)
}

fn auth_profile_node(profile_id: &str) -> String {
    format!("auth-profile:{}", profile_id)
}

fn handler_node(handler_id: &str, profile: Option<&str>) -> String {
    match profile {
        Some(profile) => format!("network/{}/profile/{}", handler_id, profile),
        None => format!("network/{}", handler_id),
    }
}

/// Credentials file contents.
#[derive(Default)]
struct SecureProperties(BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>);

impl SecureProperties {
    fn decode(bytes: &[u8], encryptor: Option<&ValueEncryptor>) -> Result<Self> {
        let plain: Cow<'_, [u8]> = if json::looks_like_json(bytes) {
            Cow::Borrowed(bytes)
        } else {
            let encryptor = encryptor.ok_or_else(|| {
                RegistryError::encryption("Credentials file is encrypted but no project key is set")
            })?;
            Cow::Owned(encryptor.decrypt(bytes)?)
        };
        serde_json::from_slice(&plain)
            .map(Self)
            .map_err(|e| RegistryError::serialization("Decoding credentials file", e))
    }

    fn record(&self, top: &str, sub: &str) -> Option<SecretRecord> {
        let node = self.0.get(top)?.get(sub)?;
        let mut record = SecretRecord::default();
        for (name, value) in node {
            match name.as_str() {
                ATTR_USER => record.user = Some(value.clone()),
                ATTR_PASSWORD => record.password = Some(value.clone()),
                _ => {
                    record.properties.insert(name.clone(), value.clone());
                }
            }
        }
        Some(record)
    }

    fn put(&mut self, top: &str, sub: &str, record: &SecretRecord) {
        if record.is_empty() {
            return;
        }
        let node = self
            .0
            .entry(top.to_string())
            .or_default()
            .entry(sub.to_string())
            .or_default();
        if let Some(user) = record.user.as_deref().filter(|u| !u.is_empty()) {
            node.insert(ATTR_USER.to_string(), user.to_string());
        }
        if let Some(password) = record.password.as_deref().filter(|p| !p.is_empty()) {
            node.insert(ATTR_PASSWORD.to_string(), password.to_string());
        }
        for (name, value) in &record.properties {
            node.insert(name.clone(), value.clone());
        }
    }

    /// Copies every node stored under `top` in `previous`.
    fn carry(&mut self, previous: &Self, top: &str) {
        if let Some(nodes) = previous.0.get(top) {
            self.0.insert(top.to_string(), nodes.clone());
        }
    }

    fn encode(&self, encryptor: Option<&ValueEncryptor>) -> Result<Option<Vec<u8>>> {
        if self.0.is_empty() {
            return Ok(None);
        }
        let plain = serde_json::to_vec(&self.0)
            .map_err(|e| RegistryError::serialization("Encoding credentials file", e))?;
        match encryptor {
            Some(encryptor) => encryptor.encrypt(&plain).map(Some),
            None => Ok(Some(plain)),
        }
    }
}

/// Secrets of one data source: its connection record and one record per
/// network handler that has any.
pub type DataSourceSecrets = (Option<SecretRecord>, Vec<(String, SecretRecord)>);

impl ModernSerializer {
    /// Reads the secrets of one data source from a credentials file.
    ///
    /// # Errors
    /// Returns error if the file is encrypted without a project key, the
    /// key is wrong or the contents are not a credentials map
    pub fn read_data_source_secrets(
        credentials: &[u8],
        encryptor: Option<&ValueEncryptor>,
        ds_id: &str,
        handler_ids: &[String],
    ) -> Result<DataSourceSecrets> {
        let secure = SecureProperties::decode(credentials, encryptor)?;
        let connection = secure.record(ds_id, NODE_CONNECTION);
        let handlers = handler_ids
            .iter()
            .filter_map(|id| {
                secure
                    .record(ds_id, &handler_node(id, None))
                    .map(|record| (id.clone(), record))
            })
            .collect();
        Ok((connection, handlers))
    }
}

/// Routes secret records to the controller or the credentials file.
struct SecretWriter<'a> {
    mode: SecretsMode,
    project_id: &'a str,
    file: SecureProperties,
    updates: Vec<SecretUpdate>,
}

impl<'a> SecretWriter<'a> {
    fn new(mode: SecretsMode, project_id: &'a str) -> Self {
        Self {
            mode,
            project_id,
            file: SecureProperties::default(),
            updates: Vec::new(),
        }
    }

    fn write(&mut self, key: String, top: &str, sub: &str, record: &SecretRecord) -> Result<()> {
        match self.mode {
            SecretsMode::Controller => {
                let value = if record.is_empty() {
                    None
                } else {
                    Some(record.to_json()?)
                };
                self.updates.push(SecretUpdate { key, value });
            }
            SecretsMode::CredentialsFile => self.file.put(top, sub, record),
        }
        Ok(())
    }

    fn data_source(&mut self, ds_id: &str, record: &SecretRecord) -> Result<()> {
        let key = data_source_key(self.project_id, ds_id);
        self.write(key, ds_id, NODE_CONNECTION, record)
    }

    fn data_source_handler(&mut self, ds_id: &str, handler_id: &str, record: &SecretRecord) -> Result<()> {
        let key = data_source_handler_key(self.project_id, ds_id, handler_id);
        self.write(key, ds_id, &handler_node(handler_id, None), record)
    }

    fn profile_handler(&mut self, profile: &str, handler_id: &str, record: &SecretRecord) -> Result<()> {
        let key = network_profile_handler_key(self.project_id, profile, handler_id);
        self.write(
            key,
            &profile_node(profile),
            &handler_node(handler_id, Some(profile)),
            record,
        )
    }

    fn auth_profile(&mut self, profile_id: &str, record: &SecretRecord) -> Result<()> {
        let key = auth_profile_key(self.project_id, profile_id);
        self.write(key, &auth_profile_node(profile_id), NODE_CONNECTION, record)
    }
}

fn connection_record(settings: &DataSourceSettings) -> SecretRecord {
    let connection = &settings.connection;
    SecretRecord {
        user: connection.user_name.clone().filter(|u| !u.is_empty()),
        password: connection
            .user_password
            .clone()
            .filter(|_| settings.save_password),
        properties: if settings.save_password {
            connection.secure_auth_properties.clone()
        } else {
            BTreeMap::new()
        },
    }
}

fn handler_record(handler: &NetworkHandlerConfiguration) -> SecretRecord {
    SecretRecord {
        user: handler.user_name.clone().filter(|u| !u.is_empty()),
        password: handler.password.clone().filter(|_| handler.save_password),
        properties: handler.secure_properties.clone(),
    }
}

/// Serializer for the JSON format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModernSerializer;

impl ModernSerializer {
    fn decode_config(
        storage: &ConfigurationStorage,
        content: &[u8],
        encryptor: Option<&ValueEncryptor>,
    ) -> Result<Object> {
        let parse = |bytes: &[u8]| -> Result<Object> {
            match serde_json::from_slice::<Value>(bytes) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(RegistryError::parse(
                    storage.storage_id(),
                    "Configuration root is not an object",
                )),
                Err(e) => Err(RegistryError::parse(storage.storage_id(), e.to_string())),
            }
        };

        if json::looks_like_json(content) {
            match (parse(content), encryptor) {
                (Ok(map), _) => return Ok(map),
                (Err(e), None) => return Err(e),
                // Ciphertext that happens to start with '{'
                (Err(_), Some(_)) => {}
            }
        }
        let encryptor = encryptor.ok_or_else(|| {
            RegistryError::encryption(format!(
                "{} is encrypted but no project key is set",
                storage.storage_id()
            ))
        })?;
        let plain = encryptor.decrypt(content)?;
        parse(&plain)
    }

    fn parse_handler(
        handler_id: &str,
        cfg: &Object,
        ctx: &ParseContext<'_>,
        secrets: Option<SecretRecord>,
    ) -> Option<NetworkHandlerConfiguration> {
        let Some(descriptor) = ctx.network_handlers.descriptor(handler_id) else {
            warn!(handler = handler_id, "Unknown network handler, skipping");
            return None;
        };
        let handler_type = json::string(cfg, "type")
            .and_then(|t| t.parse().ok())
            .unwrap_or(descriptor.handler_type);
        let mut handler = NetworkHandlerConfiguration::new(handler_id, handler_type);
        handler.enabled = json::flag(cfg, "enabled");
        handler.save_password = json::flag(cfg, "save-password");
        for (name, value) in json::string_map(cfg, "properties") {
            if descriptor.is_secured_property(&name) {
                handler.secure_properties.insert(name, value);
            } else {
                handler.properties.insert(name, value);
            }
        }
        if let Some(record) = secrets {
            handler.user_name = record.user;
            if handler.save_password {
                handler.password = record.password;
            }
            handler.secure_properties.extend(record.properties);
        }
        if let Some(user) = json::non_empty_string(cfg, ATTR_USER) {
            handler.user_name = Some(user);
        }
        if let Some(password) = json::non_empty_string(cfg, ATTR_PASSWORD) {
            handler.password = Some(password);
        }
        Some(handler)
    }

    fn parse_events(cfg: &Object, config: &mut ConnectionConfiguration) {
        for (name, event_cfg) in json::nested_objects(cfg, "events") {
            let event_type = match name.parse::<ConnectionEventType>() {
                Ok(event_type) => event_type,
                Err(e) => {
                    warn!(event = name, error = %e, "Skipping unknown connection event");
                    continue;
                }
            };
            let wait = json::flag(event_cfg, "wait-process");
            config.events.insert(
                event_type,
                ShellCommand {
                    command: json::string(event_cfg, "command").unwrap_or_default(),
                    enabled: json::flag(event_cfg, "enabled"),
                    show_panel: json::flag(event_cfg, "show-panel"),
                    wait_process_finish: wait,
                    wait_process_timeout_ms: if wait {
                        json::unsigned(event_cfg, "wait-process-timeout").unwrap_or(0)
                    } else {
                        0
                    },
                    terminate_at_disconnect: json::flag(event_cfg, "terminate-at-disconnect"),
                    pause_after_execute_ms: json::unsigned(event_cfg, "pause-after-execute")
                        .unwrap_or(0),
                    working_directory: json::non_empty_string(event_cfg, "working-directory"),
                },
            );
        }
    }

    fn parse_bootstrap(cfg: Option<&Object>) -> ConnectionBootstrap {
        let Some(cfg) = cfg else {
            return ConnectionBootstrap::default();
        };
        ConnectionBootstrap {
            default_auto_commit: json::boolean(cfg, "autocommit"),
            default_transaction_isolation: json::integer(cfg, "txnIsolation")
                .and_then(|v| i32::try_from(v).ok()),
            default_catalog: json::non_empty_string(cfg, "defaultCatalog")
                .or_else(|| json::non_empty_string(cfg, "defaultObject")),
            default_schema: json::non_empty_string(cfg, "defaultSchema"),
            ignore_errors: json::flag(cfg, "ignoreErrors"),
            init_queries: json::string_list(cfg, "initQueries"),
        }
    }

    fn parse_configuration(cfg: &Object) -> ConnectionConfiguration {
        let mut config = ConnectionConfiguration {
            host: json::non_empty_string(cfg, "host"),
            port: json::non_empty_string(cfg, "port"),
            server_name: json::non_empty_string(cfg, "server"),
            database_name: json::non_empty_string(cfg, "database"),
            url: json::non_empty_string(cfg, "url"),
            client_home: json::non_empty_string(cfg, "home"),
            connection_type: json::non_empty_string(cfg, "type"),
            connection_color: json::non_empty_string(cfg, "color"),
            keep_alive_interval: json::unsigned(cfg, "keep-alive").unwrap_or(0),
            close_idle_enabled: json::flag(cfg, "close-idle-enabled"),
            close_idle_interval: json::unsigned(cfg, "close-idle-interval").unwrap_or(0),
            auth_model: json::non_empty_string(cfg, "auth-model"),
            auth_properties: json::string_map(cfg, "auth-properties"),
            config_profile: json::non_empty_string(cfg, "config-profile"),
            auth_profile: json::non_empty_string(cfg, "auth-profile")
                .or_else(|| json::non_empty_string(cfg, "user-profile")),
            properties: json::string_map(cfg, "properties"),
            provider_properties: json::string_map(cfg, "provider-properties"),
            bootstrap: Self::parse_bootstrap(json::object(cfg, "bootstrap")),
            ..ConnectionConfiguration::default()
        };
        Self::parse_events(cfg, &mut config);
        config
    }

    fn parse_filter(cfg: &Object) -> ObjectFilter {
        ObjectFilter {
            id: json::non_empty_string(cfg, "id"),
            object_type: json::non_empty_string(cfg, "type"),
            name: json::non_empty_string(cfg, "name"),
            description: json::non_empty_string(cfg, "description"),
            enabled: json::boolean(cfg, "enabled").unwrap_or(true),
            include: json::string_list(cfg, "include"),
            exclude: json::string_list(cfg, "exclude"),
        }
    }

    fn parse_permissions(obj: &Object) -> BTreeSet<DataSourcePermission> {
        let Some(security) = json::object(obj, "security") else {
            return BTreeSet::new();
        };
        json::string_list(security, "permission-restrictions")
            .into_iter()
            .filter_map(|name| match name.parse() {
                Ok(permission) => Some(permission),
                Err(e) => {
                    debug!(error = %e, "Ignoring permission restriction");
                    None
                }
            })
            .collect()
    }

    fn parse_origin(obj: &Object) -> DataSourceOrigin {
        let Some(origin) = json::object(obj, "origin") else {
            return DataSourceOrigin::Local;
        };
        match json::non_empty_string(origin, "type") {
            None => DataSourceOrigin::Local,
            Some(kind) if kind == "local" => DataSourceOrigin::Local,
            Some(kind) => {
                let properties = origin
                    .iter()
                    .filter(|(k, _)| k.as_str() != "type")
                    .filter_map(|(k, v)| match v {
                        Value::String(s) => Some((k.clone(), s.clone())),
                        Value::Null => None,
                        other => Some((k.clone(), other.to_string())),
                    })
                    .collect();
                DataSourceOrigin::External { kind, properties }
            }
        }
    }

    fn parse_data_source(
        id: &str,
        obj: &Object,
        ctx: &ParseContext<'_>,
        secure: &SecureProperties,
        secure_readable: bool,
        models: &BTreeMap<String, Value>,
    ) -> Option<ParsedDataSource> {
        let provider_id = json::string(obj, "provider").unwrap_or_default();
        if provider_id.is_empty() {
            warn!(data_source = id, "Empty data source provider, skipping");
            return None;
        }
        let driver_id = json::string(obj, "driver").unwrap_or_default();
        let driver = ctx.drivers.resolve_driver(&provider_id, &driver_id);

        let empty = Object::new();
        let cfg = json::object(obj, "configuration").unwrap_or(&empty);
        let name = json::non_empty_string(obj, "name").unwrap_or_else(|| id.to_string());
        let mut settings = DataSourceSettings::new(name, driver, Self::parse_configuration(cfg));
        settings.description = json::non_empty_string(obj, "description");
        settings.save_password = json::flag(obj, "save-password");
        settings.read_only = json::flag(obj, "read-only");
        settings.navigator = NavigatorSettings {
            show_system_objects: json::flag(obj, "show-system-objects"),
            show_utility_objects: json::flag(obj, "show-util-objects"),
            show_only_entities: json::flag(obj, "navigator-show-only-entities"),
            hide_folders: json::flag(obj, "navigator-hide-folders"),
            hide_schemas: json::flag(obj, "navigator-hide-schemas"),
            hide_virtual_model: json::flag(obj, "navigator-hide-virtual"),
            merge_entities: json::flag(obj, "navigator-merge-entities"),
        };
        settings.folder = json::non_empty_string(obj, "folder");
        settings.lock_password_hash = json::non_empty_string(obj, "lock-passwd");
        settings.preferences = json::string_map(obj, "custom-properties");
        settings.permission_restrictions = Self::parse_permissions(obj);
        for filter_cfg in json::object_list(obj, "filters") {
            let filter = Self::parse_filter(filter_cfg);
            if filter.object_type.is_some() {
                settings.update_object_filter(filter);
            }
        }

        let mut secrets_resolved = ctx.secrets_mode == SecretsMode::CredentialsFile && secure_readable;
        if let Some(record) = secure.record(id, NODE_CONNECTION) {
            let connection = &mut settings.connection;
            connection.user_name = record.user;
            if settings.save_password {
                connection.user_password = record.password;
                connection.secure_auth_properties = record.properties;
            }
            secrets_resolved = true;
        }
        for (handler_id, handler_cfg) in json::nested_objects(cfg, "handlers") {
            let secrets = secure.record(id, &handler_node(handler_id, None));
            if let Some(handler) = Self::parse_handler(handler_id, handler_cfg, ctx, secrets) {
                settings.connection.update_handler(handler);
            }
        }

        let mut plaintext_credentials = false;
        if let Some(user) = json::non_empty_string(cfg, ATTR_USER) {
            settings.connection.user_name = Some(user);
            plaintext_credentials = true;
        }
        if let Some(password) = json::non_empty_string(cfg, ATTR_PASSWORD) {
            settings.connection.user_password = Some(password);
            plaintext_credentials = true;
        }

        let model_id = json::non_empty_string(obj, "virtual-model-id").unwrap_or_else(|| id.to_string());
        let virtual_model = models
            .get(&model_id)
            .map(|content| VirtualModel::new(model_id.clone(), content.clone()));

        Some(ParsedDataSource {
            id: id.to_string(),
            origin: Self::parse_origin(obj),
            settings,
            virtual_model,
            secrets_resolved,
            plaintext_credentials,
        })
    }

    fn parse_connection_type(id: &str, cfg: &Object) -> ConnectionType {
        let mut connection_type = match id {
            "dev" => ConnectionType::dev(),
            "test" => ConnectionType::test(),
            "prod" => ConnectionType::prod(),
            _ => ConnectionType::new(id, id),
        };
        if let Some(name) = json::non_empty_string(cfg, "name") {
            connection_type.name = name;
        }
        if let Some(color) = json::non_empty_string(cfg, "color") {
            connection_type.color = color;
        }
        if let Some(description) = json::non_empty_string(cfg, "description") {
            connection_type.description = Some(description);
        }
        let flags: [(&str, &mut bool); 5] = [
            ("auto-commit", &mut connection_type.auto_commit),
            ("confirm-execute", &mut connection_type.confirm_execute),
            ("confirm-data-change", &mut connection_type.confirm_data_change),
            ("auto-close-transactions", &mut connection_type.auto_close_transactions),
            ("auto-close-connections", &mut connection_type.auto_close_connections),
        ];
        for (key, target) in flags {
            if let Some(value) = json::boolean(cfg, key) {
                *target = value;
            }
        }
        if let Some(period) = json::unsigned(cfg, "close-transactions-period") {
            connection_type.close_transactions_period = period;
        }
        if let Some(period) = json::unsigned(cfg, "close-connections-period") {
            connection_type.close_connections_period = period;
        }
        connection_type
    }

    fn parse_drivers(root: &Object, ctx: &ParseContext<'_>) {
        for (provider_id, drivers) in json::nested_objects(root, "drivers") {
            for (driver_id, driver_value) in drivers {
                let Some(cfg) = driver_value.as_object() else {
                    continue;
                };
                let name = json::non_empty_string(cfg, "name").unwrap_or_else(|| driver_id.clone());
                let mut driver = DriverDescriptor::new(provider_id, driver_id.as_str(), name).custom();
                driver.driver_class = json::non_empty_string(cfg, "class");
                driver.sample_url = json::non_empty_string(cfg, "url");
                driver.default_port = json::unsigned(cfg, "port");
                driver.description = json::non_empty_string(cfg, "description");
                driver.anonymous_access = json::flag(cfg, "anonymous");
                debug!(driver = %driver.full_id(), "Registering custom driver");
                ctx.drivers.register_driver(driver);
            }
        }
    }

    fn parse_folders(root: &Object) -> Vec<DataSourceFolder> {
        json::nested_objects(root, "folders")
            .into_iter()
            .map(|(key, cfg)| {
                let (key_parent, name) = split_folder_path(key);
                let parent = json::non_empty_string(cfg, "parent")
                    .or_else(|| key_parent.map(str::to_string));
                let mut folder = DataSourceFolder::new(name, parent);
                folder.description = json::non_empty_string(cfg, "description");
                folder
            })
            .collect()
    }

    // Save side

    fn folders_json(folders: &[DataSourceFolder]) -> Object {
        let mut names: BTreeMap<&str, usize> = BTreeMap::new();
        for folder in folders {
            *names.entry(folder.name.as_str()).or_default() += 1;
        }
        let mut out = Object::new();
        for folder in folders {
            // Sibling-independent names are keyed by name, clashes by path
            let key = if names.get(folder.name.as_str()).copied().unwrap_or(0) > 1 {
                folder.path()
            } else {
                folder.name.clone()
            };
            let cfg = ObjectWriter::new()
                .string_ne("parent", folder.parent.as_deref())
                .string_ne("description", folder.description.as_deref())
                .build();
            out.insert(key, Value::Object(cfg));
        }
        out
    }

    fn event_json(command: &ShellCommand) -> Object {
        let mut w = ObjectWriter::new();
        w.boolean("enabled", command.enabled)
            .boolean("show-panel", command.show_panel)
            .boolean("wait-process", command.wait_process_finish);
        if command.wait_process_finish {
            w.number("wait-process-timeout", command.wait_process_timeout_ms);
        }
        w.boolean("terminate-at-disconnect", command.terminate_at_disconnect)
            .number("pause-after-execute", command.pause_after_execute_ms)
            .string_ne("working-directory", command.working_directory.as_deref())
            .string_ne("command", Some(command.command.as_str()))
            .build()
    }

    fn handler_json(handler: &NetworkHandlerConfiguration) -> Object {
        ObjectWriter::new()
            .string("type", handler.handler_type.as_str())
            .boolean("enabled", handler.enabled)
            .boolean("save-password", handler.save_password)
            .string_map("properties", &handler.properties)
            .build()
    }

    fn bootstrap_json(bootstrap: &ConnectionBootstrap) -> Object {
        let mut w = ObjectWriter::new();
        if let Some(auto_commit) = bootstrap.default_auto_commit {
            w.boolean("autocommit", auto_commit);
        }
        if let Some(isolation) = bootstrap.default_transaction_isolation {
            w.number("txnIsolation", isolation);
        }
        w.string_ne("defaultCatalog", bootstrap.default_catalog.as_deref())
            .string_ne("defaultSchema", bootstrap.default_schema.as_deref())
            .flag("ignoreErrors", bootstrap.ignore_errors)
            .string_list("initQueries", &bootstrap.init_queries)
            .build()
    }

    fn configuration_json(config: &ConnectionConfiguration) -> Object {
        let mut w = ObjectWriter::new();
        w.string_ne("host", config.host.as_deref())
            .string_ne("port", config.port.as_deref())
            .string_ne("server", config.server_name.as_deref())
            .string_ne("database", config.database_name.as_deref())
            .string_ne("url", config.url.as_deref())
            .string_ne("home", config.client_home.as_deref())
            .string_ne("type", config.connection_type.as_deref())
            .string_ne("color", config.connection_color.as_deref());
        if config.keep_alive_interval > 0 {
            w.number("keep-alive", config.keep_alive_interval);
        }
        w.flag("close-idle-enabled", config.close_idle_enabled);
        if config.close_idle_interval > 0 {
            w.number("close-idle-interval", config.close_idle_interval);
        }
        w.string_ne("auth-model", config.auth_model.as_deref())
            .string_map("auth-properties", &config.auth_properties)
            .string_ne("config-profile", config.config_profile.as_deref())
            .string_ne("auth-profile", config.auth_profile.as_deref())
            .string_map("properties", &config.properties)
            .string_map("provider-properties", &config.provider_properties);

        let events: Object = config
            .events
            .iter()
            .filter(|(_, command)| command.enabled)
            .map(|(event, command)| (event.as_str().to_string(), Value::Object(Self::event_json(command))))
            .collect();
        w.object_ne("events", events);

        let handlers: Object = config
            .handlers
            .iter()
            .filter(|h| h.enabled)
            .map(|h| (h.id.clone(), Value::Object(Self::handler_json(h))))
            .collect();
        w.object_ne("handlers", handlers);

        if !config.bootstrap.is_empty() {
            w.object("bootstrap", Self::bootstrap_json(&config.bootstrap));
        }
        w.build()
    }

    fn filter_json(filter: &ObjectFilter) -> Value {
        Value::Object(
            ObjectWriter::new()
                .string_ne("id", filter.id.as_deref())
                .string_ne("type", filter.object_type.as_deref())
                .string_ne("name", filter.name.as_deref())
                .string_ne("description", filter.description.as_deref())
                .boolean("enabled", filter.enabled)
                .string_list("include", &filter.include)
                .string_list("exclude", &filter.exclude)
                .build(),
        )
    }

    fn data_source_json(ds: &DataSourceSnapshot) -> Object {
        let settings = &ds.settings;
        let navigator = &settings.navigator;
        let mut w = ObjectWriter::new();
        w.string("provider", settings.driver.provider_id())
            .string("driver", settings.driver.id())
            .string("name", settings.name.as_str())
            .string_ne("description", settings.description.as_deref())
            .boolean("save-password", settings.save_password)
            .flag("show-system-objects", navigator.show_system_objects)
            .flag("show-util-objects", navigator.show_utility_objects)
            .flag("navigator-show-only-entities", navigator.show_only_entities)
            .flag("navigator-hide-folders", navigator.hide_folders)
            .flag("navigator-hide-schemas", navigator.hide_schemas)
            .flag("navigator-hide-virtual", navigator.hide_virtual_model)
            .flag("navigator-merge-entities", navigator.merge_entities)
            .boolean("read-only", settings.read_only)
            .string_ne("folder", settings.folder.as_deref())
            .string_ne("lock-passwd", settings.lock_password_hash.as_deref());

        if let DataSourceOrigin::External { kind, properties } = &ds.origin {
            let mut origin = ObjectWriter::new();
            origin.string("type", kind.as_str());
            for (name, value) in properties {
                origin.string(name, value.as_str());
            }
            w.object("origin", origin.build());
        }
        if let Some(model) = ds.virtual_model.as_ref().filter(|m| m.id != ds.id) {
            w.string("virtual-model-id", model.id.as_str());
        }
        w.object("configuration", Self::configuration_json(&settings.connection));

        if !settings.permission_restrictions.is_empty() {
            let permissions: Vec<String> = settings
                .permission_restrictions
                .iter()
                .map(|p| p.as_str().to_string())
                .collect();
            w.object(
                "security",
                ObjectWriter::new()
                    .string_list("permission-restrictions", &permissions)
                    .build(),
            );
        }
        let filters: Vec<Value> = settings
            .filters
            .iter()
            .filter(|f| !f.is_empty())
            .map(Self::filter_json)
            .collect();
        if !filters.is_empty() {
            w.value("filters", Value::Array(filters));
        }
        w.string_map("custom-properties", &settings.preferences);
        w.build()
    }

    fn network_profiles_json(profiles: &[NetworkProfile], secrets: &mut SecretWriter<'_>) -> Result<Object> {
        let mut out = Object::new();
        for profile in profiles {
            let mut handlers = Object::new();
            for handler in &profile.handlers {
                secrets.profile_handler(&profile.name, &handler.id, &handler_record(handler))?;
                handlers.insert(handler.id.clone(), Value::Object(Self::handler_json(handler)));
            }
            let cfg = ObjectWriter::new()
                .string_ne("description", profile.description.as_deref())
                .string_map("properties", &profile.properties)
                .object("handlers", handlers)
                .build();
            out.insert(profile.name.clone(), Value::Object(cfg));
        }
        Ok(out)
    }

    fn auth_profiles_json(profiles: &[AuthProfile], secrets: &mut SecretWriter<'_>) -> Result<Object> {
        let mut out = Object::new();
        for profile in profiles {
            let record = SecretRecord {
                user: profile.user_name.clone().filter(|u| !u.is_empty()),
                password: profile.user_password.clone().filter(|_| profile.save_password),
                properties: BTreeMap::new(),
            };
            secrets.auth_profile(&profile.id, &record)?;
            let cfg = ObjectWriter::new()
                .string("name", profile.name.as_str())
                .string_ne("auth-model", profile.auth_model.as_deref())
                .boolean("save-password", profile.save_password)
                .string_map("properties", &profile.properties)
                .build();
            out.insert(profile.id.clone(), Value::Object(cfg));
        }
        Ok(out)
    }

    fn connection_types_json(types: &[ConnectionType]) -> Object {
        types
            .iter()
            .map(|ct| {
                let cfg = ObjectWriter::new()
                    .string("name", ct.name.as_str())
                    .string_ne("color", Some(ct.color.as_str()))
                    .string_ne("description", ct.description.as_deref())
                    .boolean("auto-commit", ct.auto_commit)
                    .boolean("confirm-execute", ct.confirm_execute)
                    .boolean("confirm-data-change", ct.confirm_data_change)
                    .boolean("auto-close-transactions", ct.auto_close_transactions)
                    .number("close-transactions-period", ct.close_transactions_period)
                    .boolean("auto-close-connections", ct.auto_close_connections)
                    .number("close-connections-period", ct.close_connections_period)
                    .build();
                (ct.id.clone(), Value::Object(cfg))
            })
            .collect()
    }

    fn drivers_json(drivers: &[Arc<DriverDescriptor>]) -> Object {
        let mut by_provider: BTreeMap<&str, Object> = BTreeMap::new();
        for driver in drivers.iter().filter(|d| d.custom && !d.temporary) {
            let mut w = ObjectWriter::new();
            w.string("name", driver.name.as_str())
                .string_ne("class", driver.driver_class.as_deref())
                .string_ne("url", driver.sample_url.as_deref());
            if let Some(port) = driver.default_port {
                w.number("port", port);
            }
            w.string_ne("description", driver.description.as_deref())
                .flag("anonymous", driver.anonymous_access);
            by_provider
                .entry(driver.provider_id())
                .or_default()
                .insert(driver.id().to_string(), Value::Object(w.build()));
        }
        by_provider
            .into_iter()
            .map(|(provider, drivers)| (provider.to_string(), Value::Object(drivers)))
            .collect()
    }
}

impl DataSourceSerializer for ModernSerializer {
    fn parse_data_sources(
        &self,
        storage: &ConfigurationStorage,
        content: &[u8],
        ctx: &ParseContext<'_>,
    ) -> Result<ParsedConfiguration> {
        let (secure, secure_readable) = match ctx.credentials {
            Some(bytes) => match SecureProperties::decode(bytes, ctx.encryptor) {
                Ok(secure) => (secure, true),
                Err(e) => {
                    warn!(storage = %storage, error = %e, "Cannot read credentials file");
                    (SecureProperties::default(), false)
                }
            },
            None => (SecureProperties::default(), true),
        };
        let root = Self::decode_config(storage, content, ctx.encryptor)?;

        let mut parsed = ParsedConfiguration {
            folders: Self::parse_folders(&root),
            profile_secrets_resolved: ctx.secrets_mode == SecretsMode::CredentialsFile,
            ..ParsedConfiguration::default()
        };

        for (id, cfg) in json::nested_objects(&root, "connection-types") {
            parsed.connection_types.push(Self::parse_connection_type(id, cfg));
        }
        Self::parse_drivers(&root, ctx);

        let models: BTreeMap<String, Value> = json::object(&root, "virtual-models")
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        for (name, cfg) in json::nested_objects(&root, "network-profiles") {
            let mut profile = NetworkProfile::new(name);
            profile.description = json::non_empty_string(cfg, "description");
            profile.properties = json::string_map(cfg, "properties");
            for (handler_id, handler_cfg) in json::nested_objects(cfg, "handlers") {
                let secrets = secure.record(&profile_node(name), &handler_node(handler_id, Some(name)));
                if let Some(handler) = Self::parse_handler(handler_id, handler_cfg, ctx, secrets) {
                    profile.handlers.push(handler);
                }
            }
            parsed.network_profiles.push(profile);
        }

        for (id, cfg) in json::nested_objects(&root, "auth-profiles") {
            let name = json::non_empty_string(cfg, "name").unwrap_or_else(|| id.to_string());
            let mut profile = AuthProfile::new(id, name);
            profile.auth_model = json::non_empty_string(cfg, "auth-model");
            profile.save_password = json::flag(cfg, "save-password");
            profile.properties = json::string_map(cfg, "properties");
            if let Some(record) = secure.record(&auth_profile_node(id), NODE_CONNECTION) {
                profile.user_name = record.user;
                if profile.save_password {
                    profile.user_password = record.password;
                }
            }
            parsed.auth_profiles.push(profile);
        }

        for (id, cfg) in json::nested_objects(&root, "connections") {
            if let Some(data_source) = Self::parse_data_source(id, cfg, ctx, &secure, secure_readable, &models) {
                parsed.data_sources.push(data_source);
            }
        }

        parsed.saved_filters = json::object_list(&root, "saved-filters")
            .into_iter()
            .map(Self::parse_filter)
            .collect();
        if let Some(external) = json::object(&root, "external-configurations") {
            parsed.external_configurations = external
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }

        debug!(
            storage = %storage,
            data_sources = parsed.data_sources.len(),
            folders = parsed.folders.len(),
            "Parsed modern configuration"
        );
        Ok(parsed)
    }

    fn save_data_sources(
        &self,
        storage: &ConfigurationStorage,
        data: &SaveData<'_>,
    ) -> Result<SavedConfiguration> {
        let mut secrets = SecretWriter::new(data.secrets_mode, data.project_id);
        let previous = match (data.secrets_mode, data.previous_credentials) {
            (SecretsMode::CredentialsFile, Some(bytes)) => Some(SecureProperties::decode(bytes, data.encryptor)),
            _ => None,
        };
        let mut keep_credentials = false;
        let mut root = ObjectWriter::new();
        if storage.is_default() {
            root.object("folders", Self::folders_json(data.folders));
        }

        let mut connections = Object::new();
        let mut models = Object::new();
        for ds in data.data_sources {
            connections.insert(ds.id.clone(), Value::Object(Self::data_source_json(ds)));
            if let Some(model) = ds.virtual_model.as_ref().filter(|m| m.has_valuable_data()) {
                models.insert(model.id.clone(), model.content.clone());
            }
            if ds.persist_secrets {
                secrets.data_source(&ds.id, &connection_record(&ds.settings))?;
                for handler in ds.settings.connection.handlers.iter().filter(|h| h.enabled) {
                    secrets.data_source_handler(&ds.id, &handler.id, &handler_record(handler))?;
                }
            } else {
                match &previous {
                    Some(Ok(previous)) => secrets.file.carry(previous, &ds.id),
                    Some(Err(_)) => keep_credentials = true,
                    None => {}
                }
            }
        }
        root.object("connections", connections);
        root.object_ne("virtual-models", models);

        if storage.is_default() {
            let profiles = Self::network_profiles_json(data.network_profiles, &mut secrets)?;
            root.object_ne("network-profiles", profiles);
            let auth_profiles = Self::auth_profiles_json(data.auth_profiles, &mut secrets)?;
            root.object_ne("auth-profiles", auth_profiles);
            let saved_filters: Vec<Value> = data
                .saved_filters
                .iter()
                .filter(|f| !f.is_empty())
                .map(Self::filter_json)
                .collect();
            if !saved_filters.is_empty() {
                root.value("saved-filters", Value::Array(saved_filters));
            }
            root.object_ne("connection-types", Self::connection_types_json(data.connection_types));
            root.object_ne("drivers", Self::drivers_json(data.custom_drivers));
            let external: Object = data
                .external_configurations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            root.object_ne("external-configurations", external);
        }

        let bytes = json::to_pretty_bytes(root.build())?;
        let config = if data.encrypt_project {
            let encryptor = data.encryptor.ok_or_else(|| {
                RegistryError::encryption("Project encryption is enabled but no project key is set")
            })?;
            encryptor.encrypt(&bytes)?
        } else {
            bytes
        };
        let credentials = match data.secrets_mode {
            SecretsMode::Controller => None,
            SecretsMode::CredentialsFile => secrets.file.encode(data.encryptor)?,
        };
        if keep_credentials {
            warn!(storage = %storage, "Credentials file is unreadable, leaving it unchanged");
        }

        debug!(
            storage = %storage,
            data_sources = data.data_sources.len(),
            secret_updates = secrets.updates.len(),
            "Serialized modern configuration"
        );
        Ok(SavedConfiguration {
            config,
            credentials,
            keep_credentials,
            secrets: secrets.updates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkHandlerType;
    use crate::network::NetworkHandlerRegistry;
    use crate::provider::DriverRegistry;
    use std::path::Path;

    struct Fixture {
        drivers: DriverRegistry,
        handlers: NetworkHandlerRegistry,
        storage: ConfigurationStorage,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                drivers: DriverRegistry::builtin(),
                handlers: NetworkHandlerRegistry::builtin(),
                storage: ConfigurationStorage::default_modern(Path::new("/project/.dbeaver")),
            }
        }

        fn ctx<'a>(
            &'a self,
            mode: SecretsMode,
            encryptor: Option<&'a ValueEncryptor>,
            credentials: Option<&'a [u8]>,
        ) -> ParseContext<'a> {
            ParseContext {
                drivers: &self.drivers,
                network_handlers: &self.handlers,
                encryptor,
                credentials,
                secrets_mode: mode,
            }
        }

        fn snapshot(&self) -> DataSourceSnapshot {
            let driver = self.drivers.resolve_driver("postgresql", "postgres-jdbc");
            let mut tunnel = NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel)
                .with_property("host", "bastion.internal");
            tunnel.save_password = true;
            tunnel.user_name = Some("jump".to_string());
            tunnel.password = Some("tunnel-secret".to_string());
            let connection = ConnectionConfiguration::new("db.internal")
                .with_port("5432")
                .with_database("sales")
                .with_credentials("scott", Some("tiger".to_string()))
                .with_connection_type("prod")
                .with_property("ssl", "true")
                .with_handler(tunnel)
                .with_event(ConnectionEventType::BeforeConnect, ShellCommand::new("vpn up"));
            let mut settings = DataSourceSettings::new("Sales", driver, connection)
                .in_folder("Production")
                .with_description("Main sales database");
            settings.update_object_filter(ObjectFilter::new("schema").including(["public"]));
            settings.permission_restrictions.insert(DataSourcePermission::EditMetadata);
            DataSourceSnapshot {
                id: "postgres-jdbc-1".to_string(),
                origin: DataSourceOrigin::Local,
                settings,
                virtual_model: None,
                persist_secrets: true,
            }
        }
    }

    fn save_data<'a>(
        snapshots: &'a [DataSourceSnapshot],
        folders: &'a [DataSourceFolder],
        external: &'a BTreeMap<String, Value>,
        mode: SecretsMode,
        encryptor: Option<&'a ValueEncryptor>,
    ) -> SaveData<'a> {
        SaveData {
            project_id: "General",
            data_sources: snapshots,
            folders,
            network_profiles: &[],
            auth_profiles: &[],
            saved_filters: &[],
            connection_types: &[],
            custom_drivers: &[],
            external_configurations: external,
            secrets_mode: mode,
            encryptor,
            encrypt_project: false,
            previous_credentials: None,
        }
    }

    #[test]
    fn test_roundtrip_with_credentials_file() {
        let fixture = Fixture::new();
        let encryptor = ValueEncryptor::generate();
        let snapshots = vec![fixture.snapshot()];
        let folders = vec![DataSourceFolder::new("Production", None)];
        let external = BTreeMap::new();
        let data = save_data(&snapshots, &folders, &external, SecretsMode::CredentialsFile, Some(&encryptor));

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        let config_text = String::from_utf8(saved.config.clone()).unwrap();
        assert!(!config_text.contains("tiger"));
        assert!(!config_text.contains("tunnel-secret"));
        assert!(!config_text.contains("scott"));
        assert!(saved.secrets.is_empty());

        let credentials = saved.credentials.unwrap();
        assert!(!json::looks_like_json(&credentials));

        let ctx = fixture.ctx(SecretsMode::CredentialsFile, Some(&encryptor), Some(&credentials));
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, &saved.config, &ctx)
            .unwrap();
        assert_eq!(parsed.folders, folders);
        assert_eq!(parsed.data_sources.len(), 1);
        let ds = &parsed.data_sources[0];
        assert!(ds.secrets_resolved);
        assert!(!ds.plaintext_credentials);
        assert_eq!(ds.settings, snapshots[0].settings);
    }

    #[test]
    fn test_controller_mode_emits_secret_updates() {
        let fixture = Fixture::new();
        let snapshots = vec![fixture.snapshot()];
        let external = BTreeMap::new();
        let data = save_data(&snapshots, &[], &external, SecretsMode::Controller, None);

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        assert!(saved.credentials.is_none());
        let keys: Vec<&str> = saved.secrets.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(
            keys,
            [
                "datasources/General/postgres-jdbc-1",
                "datasources/General/postgres-jdbc-1/network/ssh_tunnel"
            ]
        );
        let record = SecretRecord::from_json(saved.secrets[0].value.as_deref().unwrap()).unwrap();
        assert_eq!(record.user.as_deref(), Some("scott"));
        assert_eq!(record.password.as_deref(), Some("tiger"));

        let ctx = fixture.ctx(SecretsMode::Controller, None, None);
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, &saved.config, &ctx)
            .unwrap();
        let ds = &parsed.data_sources[0];
        assert!(!ds.secrets_resolved);
        assert!(ds.settings.connection.user_name.is_none());
        assert!(ds.settings.connection.user_password.is_none());
    }

    #[test]
    fn test_unresolved_secrets_are_not_written() {
        let fixture = Fixture::new();
        let mut snapshot = fixture.snapshot();
        snapshot.persist_secrets = false;
        let snapshots = vec![snapshot];
        let external = BTreeMap::new();
        let data = save_data(&snapshots, &[], &external, SecretsMode::Controller, None);

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        assert!(saved.secrets.is_empty());
    }

    #[test]
    fn test_unresolved_secrets_are_carried_in_credentials_file() {
        let fixture = Fixture::new();
        let external = BTreeMap::new();
        let snapshots = vec![fixture.snapshot()];
        let data = save_data(&snapshots, &[], &external, SecretsMode::CredentialsFile, None);
        let first = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        let previous = first.credentials.unwrap();

        let mut forgotten = fixture.snapshot();
        forgotten.settings.connection.clear_secrets();
        forgotten.persist_secrets = false;
        let snapshots = vec![forgotten];
        let mut data = save_data(&snapshots, &[], &external, SecretsMode::CredentialsFile, None);
        data.previous_credentials = Some(&previous);
        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        assert!(!saved.keep_credentials);
        assert_eq!(saved.credentials.as_deref(), Some(previous.as_slice()));

        let (connection, handlers) = ModernSerializer::read_data_source_secrets(
            &previous,
            None,
            "postgres-jdbc-1",
            &["ssh_tunnel".to_string()],
        )
        .unwrap();
        assert_eq!(connection.unwrap().password.as_deref(), Some("tiger"));
        assert_eq!(handlers.len(), 1);
    }

    #[test]
    fn test_unreadable_credentials_file_is_kept() {
        let fixture = Fixture::new();
        let encryptor = ValueEncryptor::generate();
        let external = BTreeMap::new();
        let snapshots = vec![fixture.snapshot()];
        let data = save_data(&snapshots, &[], &external, SecretsMode::CredentialsFile, Some(&encryptor));
        let sealed = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap().credentials.unwrap();

        // Read back with another key: nothing resolves
        let other = ValueEncryptor::generate();
        let ctx = fixture.ctx(SecretsMode::CredentialsFile, Some(&other), Some(&sealed));
        let config = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap().config;
        let parsed = ModernSerializer.parse_data_sources(&fixture.storage, &config, &ctx).unwrap();
        assert!(!parsed.data_sources[0].secrets_resolved);

        let mut unresolved = fixture.snapshot();
        unresolved.persist_secrets = false;
        let snapshots = vec![unresolved];
        let mut data = save_data(&snapshots, &[], &external, SecretsMode::CredentialsFile, Some(&other));
        data.previous_credentials = Some(&sealed);
        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        assert!(saved.keep_credentials);
    }

    #[test]
    fn test_password_not_saved_without_save_password() {
        let fixture = Fixture::new();
        let mut snapshot = fixture.snapshot();
        snapshot.settings.save_password = false;
        let snapshots = vec![snapshot];
        let external = BTreeMap::new();
        let data = save_data(&snapshots, &[], &external, SecretsMode::Controller, None);

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        let record = SecretRecord::from_json(saved.secrets[0].value.as_deref().unwrap()).unwrap();
        assert_eq!(record.user.as_deref(), Some("scott"));
        assert!(record.password.is_none());
    }

    #[test]
    fn test_plaintext_credentials_override() {
        let fixture = Fixture::new();
        let content = br#"{
            "connections": {
                "pg": {
                    "provider": "postgresql",
                    "driver": "postgres-jdbc",
                    "name": "PG",
                    "save-password": true,
                    "configuration": {
                        "host": "localhost",
                        "port": 5432,
                        "user": "admin",
                        "password": "plain",
                        "user-profile": "ldap"
                    }
                }
            }
        }"#;
        let credentials = br##"{"pg":{"#connection":{"user":"secure-user","password":"secure-pw"}}}"##;
        let ctx = fixture.ctx(SecretsMode::CredentialsFile, None, Some(credentials));
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, content, &ctx)
            .unwrap();
        let ds = &parsed.data_sources[0];
        assert!(ds.plaintext_credentials);
        assert_eq!(ds.settings.connection.user_name.as_deref(), Some("admin"));
        assert_eq!(ds.settings.connection.user_password.as_deref(), Some("plain"));
        assert_eq!(ds.settings.connection.port.as_deref(), Some("5432"));
        assert_eq!(ds.settings.connection.auth_profile.as_deref(), Some("ldap"));
    }

    #[test]
    fn test_bad_entries_are_skipped_or_get_placeholders() {
        let fixture = Fixture::new();
        let content = br#"{
            "connections": {
                "no-provider": {"driver": "x", "name": "Broken"},
                "missing-driver": {
                    "provider": "db2",
                    "driver": "db2_zos",
                    "configuration": {
                        "handlers": {
                            "ssh_tunnel": {"type": "TUNNEL", "enabled": true},
                            "telepathy": {"enabled": true}
                        }
                    }
                }
            }
        }"#;
        let ctx = fixture.ctx(SecretsMode::CredentialsFile, None, None);
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, content, &ctx)
            .unwrap();
        assert_eq!(parsed.data_sources.len(), 1);
        let ds = &parsed.data_sources[0];
        assert_eq!(ds.id, "missing-driver");
        assert_eq!(ds.settings.name, "missing-driver");
        assert!(ds.settings.driver.is_placeholder());
        let handler_ids: Vec<&str> = ds.settings.connection.handlers.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(handler_ids, ["ssh_tunnel"]);
    }

    #[test]
    fn test_encrypted_project_roundtrip() {
        let fixture = Fixture::new();
        let encryptor = ValueEncryptor::generate();
        let snapshots = vec![fixture.snapshot()];
        let external = BTreeMap::new();
        let mut data = save_data(&snapshots, &[], &external, SecretsMode::CredentialsFile, Some(&encryptor));
        data.encrypt_project = true;

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        assert!(!String::from_utf8_lossy(&saved.config).contains("db.internal"));

        let no_key = fixture.ctx(SecretsMode::CredentialsFile, None, None);
        assert!(
            ModernSerializer
                .parse_data_sources(&fixture.storage, &saved.config, &no_key)
                .is_err()
        );

        let credentials = saved.credentials.clone();
        let ctx = fixture.ctx(SecretsMode::CredentialsFile, Some(&encryptor), credentials.as_deref());
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, &saved.config, &ctx)
            .unwrap();
        assert_eq!(parsed.data_sources[0].settings, snapshots[0].settings);
    }

    #[test]
    fn test_default_storage_sections_and_order() {
        let fixture = Fixture::new();
        let snapshots = vec![fixture.snapshot()];
        let folders = vec![DataSourceFolder::new("Production", None)];
        let mut external = BTreeMap::new();
        external.insert("cloud".to_string(), serde_json::json!({"region": "eu"}));
        let types = vec![ConnectionType::new("staging", "Staging")];
        let custom = vec![Arc::new(
            DriverDescriptor::new("generic", "duck", "DuckDB").custom(),
        )];
        let mut data = save_data(&snapshots, &folders, &external, SecretsMode::CredentialsFile, None);
        data.connection_types = &types;
        data.custom_drivers = &custom;

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        let value: Value = serde_json::from_slice(&saved.config).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["folders", "connections", "connection-types", "drivers", "external-configurations"]
        );

        let secondary = ConfigurationStorage::modern(Path::new("/project/.dbeaver"), "-team");
        let saved = ModernSerializer.save_data_sources(&secondary, &data).unwrap();
        let value: Value = serde_json::from_slice(&saved.config).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["connections"]);

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        let fresh = Fixture::new();
        let ctx = fresh.ctx(SecretsMode::CredentialsFile, None, None);
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, &saved.config, &ctx)
            .unwrap();
        assert_eq!(parsed.connection_types[0].id, "staging");
        assert_eq!(parsed.external_configurations["cloud"]["region"], "eu");
        assert!(fresh.drivers.find_driver("generic", "duck").is_some_and(|d| d.custom));
    }

    #[test]
    fn test_profiles_roundtrip_through_credentials_file() {
        let fixture = Fixture::new();
        let mut tunnel = NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel);
        tunnel.save_password = true;
        tunnel.password = Some("jump-pw".to_string());
        let mut network = NetworkProfile::new("bastion");
        network.handlers.push(tunnel);
        let mut auth = AuthProfile::new("ldap", "LDAP");
        auth.save_password = true;
        auth.user_name = Some("svc".to_string());
        auth.user_password = Some("svc-pw".to_string());
        let networks = vec![network];
        let auths = vec![auth];
        let external = BTreeMap::new();
        let mut data = save_data(&[], &[], &external, SecretsMode::CredentialsFile, None);
        data.network_profiles = &networks;
        data.auth_profiles = &auths;

        let saved = ModernSerializer.save_data_sources(&fixture.storage, &data).unwrap();
        assert!(!String::from_utf8_lossy(&saved.config).contains("pw"));
        let credentials = saved.credentials.unwrap();
        let raw: Value = serde_json::from_slice(&credentials).unwrap();
        assert_eq!(
            raw["profile:bastion"]["network/ssh_tunnel/profile/bastion"]["password"],
            "jump-pw"
        );

        let ctx = fixture.ctx(SecretsMode::CredentialsFile, None, Some(&credentials));
        let parsed = ModernSerializer
            .parse_data_sources(&fixture.storage, &saved.config, &ctx)
            .unwrap();
        assert!(parsed.profile_secrets_resolved);
        assert_eq!(parsed.network_profiles, networks);
        assert_eq!(parsed.auth_profiles, auths);
    }

    #[test]
    fn test_folder_name_clash_keyed_by_path() {
        let folders = vec![
            DataSourceFolder::new("EU", Some("Production".to_string())),
            DataSourceFolder::new("EU", Some("Staging".to_string())),
            DataSourceFolder::new("Production", None),
        ];
        let out = ModernSerializer::folders_json(&folders);
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, ["Production/EU", "Staging/EU", "Production"]);

        let mut root = Object::new();
        root.insert("folders".to_string(), Value::Object(out));
        assert_eq!(ModernSerializer::parse_folders(&root), folders);
    }
}

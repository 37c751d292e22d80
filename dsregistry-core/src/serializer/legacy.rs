//! Legacy `data-sources*.xml` format.
//!
//! Read-only. Passwords are stored inline in obfuscated form; everything
//! read from these files is migrated to the modern format on the next save.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{
    DataSourceSerializer, ParseContext, ParsedConfiguration, ParsedDataSource, SaveData,
    SavedConfiguration,
};
use crate::Result;
use crate::error::RegistryError;
use crate::model::{
    ConnectionConfiguration, ConnectionEventType, DataSourceFolder, DataSourceOrigin,
    DataSourceSettings, NavigatorSettings, NetworkHandlerConfiguration, ObjectFilter,
    ShellCommand,
};
use crate::security::legacy::decode_legacy_password;
use crate::storage::ConfigurationStorage;

/// Connection properties with this prefix belong to the provider.
const INTERNAL_PROP_PREFIX: &str = "@dbeaver-";

const PREF_DEFAULT_AUTO_COMMIT: &str = "default.autocommit";
const PREF_DEFAULT_ISOLATION: &str = "default.isolation";
const PREF_DEFAULT_ACTIVE_OBJECT: &str = "default.activeObject";

#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attrs: BTreeMap<String, String>,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn start(e: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let mut element = Self {
            name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            ..Self::default()
        };
        for attr in e.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            element.attrs.insert(key, value.into_owned());
        }
        Ok(element)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        self.attr(name).filter(|v| !v.is_empty()).map(str::to_string)
    }

    fn flag(&self, name: &str) -> bool {
        self.attr(name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {}
    }
}

/// Builds the element tree; whitespace-only text is dropped.
fn parse_tree(content: &str) -> std::result::Result<XmlElement, String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let position = reader.buffer_position();
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(XmlElement::start(&e)?),
            Ok(Event::Empty(e)) => {
                let element = XmlElement::start(&e)?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| format!("Unbalanced end tag at byte {}", position))?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::Text(t)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape().map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("XML error at byte {}: {}", position, e)),
        }
    }
    if let Some(open) = stack.last() {
        return Err(format!("Unclosed element <{}>", open.name));
    }
    root.ok_or_else(|| "Document has no root element".to_string())
}

/// Serializer for the XML format.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacySerializer;

impl LegacySerializer {
    fn parse_folder(el: &XmlElement) -> Option<DataSourceFolder> {
        let Some(name) = el.non_empty("name") else {
            warn!("Folder without a name, skipping");
            return None;
        };
        let mut folder = DataSourceFolder::new(name, el.non_empty("parent"));
        folder.description = el.non_empty("description");
        Some(folder)
    }

    fn parse_filter(el: &XmlElement) -> ObjectFilter {
        let masks = |tag: &'static str| -> Vec<String> {
            el.children_named(tag)
                .map(|c| c.attr("name").unwrap_or_default().to_string())
                .collect()
        };
        ObjectFilter {
            id: el.non_empty("id"),
            object_type: el.non_empty("type"),
            name: el.non_empty("name"),
            description: el.non_empty("description"),
            enabled: el.attr("enabled").is_none_or(|v| v.eq_ignore_ascii_case("true")),
            include: masks("include"),
            exclude: masks("exclude"),
        }
    }

    fn parse_connection(el: &XmlElement, save_password: bool, ds_id: &str) -> ConnectionConfiguration {
        let mut config = ConnectionConfiguration {
            host: el.non_empty("host"),
            port: el.non_empty("port"),
            server_name: el.non_empty("server"),
            database_name: el.non_empty("database"),
            url: el.non_empty("url"),
            client_home: el.non_empty("home"),
            connection_type: el.non_empty("type"),
            connection_color: el.non_empty("color"),
            user_name: el.non_empty("user"),
            ..ConnectionConfiguration::default()
        };
        if save_password {
            config.user_password = el.attr("password").and_then(decode_legacy_password);
        }
        if let Some(keep_alive) = el.non_empty("keep-alive") {
            match keep_alive.trim().parse() {
                Ok(interval) => config.keep_alive_interval = interval,
                Err(e) => warn!(data_source = ds_id, value = %keep_alive, error = %e, "Bad keep-alive interval"),
            }
        }
        config
    }

    fn parse_event(el: &XmlElement) -> Option<(ConnectionEventType, ShellCommand)> {
        let type_name = el.attr("type").unwrap_or_default();
        let event_type = match type_name.parse::<ConnectionEventType>() {
            Ok(event_type) => event_type,
            Err(e) => {
                warn!(event = type_name, error = %e, "Skipping unknown connection event");
                return None;
            }
        };
        let wait = el.flag("wait-process");
        let number = |name: &str| el.attr(name).and_then(|v| v.trim().parse::<u64>().ok());
        let command = ShellCommand {
            command: el.text.clone(),
            enabled: el.flag("enabled"),
            show_panel: el.flag("show-panel"),
            wait_process_finish: wait,
            wait_process_timeout_ms: if wait {
                number("wait-process-timeout").unwrap_or(0)
            } else {
                0
            },
            terminate_at_disconnect: el.flag("terminate-at-disconnect"),
            pause_after_execute_ms: number("pause-after-execute").unwrap_or(0),
            working_directory: el.non_empty("working-directory"),
        };
        Some((event_type, command))
    }

    fn parse_handler(el: &XmlElement, ctx: &ParseContext<'_>) -> Option<NetworkHandlerConfiguration> {
        let handler_id = el.attr("id").unwrap_or_default();
        let Some(descriptor) = ctx.network_handlers.descriptor(handler_id) else {
            warn!(handler = handler_id, "Unknown network handler, skipping");
            return None;
        };
        let handler_type = el
            .attr("type")
            .and_then(|t| t.parse().ok())
            .unwrap_or(descriptor.handler_type);
        let mut handler = NetworkHandlerConfiguration::new(handler_id, handler_type);
        handler.enabled = el.flag("enabled");
        handler.save_password = el.flag("save-password");
        handler.user_name = el.non_empty("user");
        if handler.save_password {
            handler.password = el.attr("password").and_then(decode_legacy_password);
        }
        for property in el.children_named("property") {
            let Some(name) = property.non_empty("name") else {
                continue;
            };
            let value = property.attr("value").unwrap_or_default().to_string();
            if descriptor.is_secured_property(&name) {
                handler.secure_properties.insert(name, value);
            } else {
                handler.properties.insert(name, value);
            }
        }
        Some(handler)
    }

    fn parse_bootstrap(el: &XmlElement, config: &mut ConnectionConfiguration) {
        let bootstrap = &mut config.bootstrap;
        if let Some(value) = el.attr("autocommit") {
            bootstrap.default_auto_commit = Some(value.eq_ignore_ascii_case("true"));
        }
        if let Some(value) = el.attr("txnIsolation") {
            bootstrap.default_transaction_isolation = value.trim().parse().ok();
        }
        if let Some(catalog) = el.non_empty("defaultObject") {
            bootstrap.default_catalog = Some(catalog);
        }
        if el.attr("ignoreErrors").is_some() {
            bootstrap.ignore_errors = el.flag("ignoreErrors");
        }
        bootstrap.init_queries.extend(
            el.children_named("query")
                .filter(|q| !q.text.is_empty())
                .map(|q| q.text.clone()),
        );
    }

    fn apply_custom_property(name: &str, value: &str, settings: &mut DataSourceSettings) {
        let bootstrap = &mut settings.connection.bootstrap;
        match name {
            PREF_DEFAULT_AUTO_COMMIT => {
                bootstrap.default_auto_commit = Some(value.eq_ignore_ascii_case("true"));
            }
            PREF_DEFAULT_ISOLATION => {
                bootstrap.default_transaction_isolation = value.trim().parse().ok();
            }
            PREF_DEFAULT_ACTIVE_OBJECT => {
                if !value.is_empty() {
                    bootstrap.default_catalog = Some(value.to_string());
                }
            }
            _ => {
                settings.preferences.insert(name.to_string(), value.to_string());
            }
        }
    }

    fn parse_data_source(el: &XmlElement, ctx: &ParseContext<'_>) -> Option<ParsedDataSource> {
        let name = el.attr("name").unwrap_or_default().to_string();
        let id = el.non_empty("id").unwrap_or_else(|| name.clone());
        if id.is_empty() {
            warn!("Data source without id or name, skipping");
            return None;
        }
        let Some(provider_id) = el.non_empty("provider") else {
            warn!(data_source = %id, "Empty data source provider, skipping");
            return None;
        };
        let driver = ctx
            .drivers
            .resolve_driver(&provider_id, el.attr("driver").unwrap_or_default());

        let save_password = el.flag("save-password");
        let connection = el
            .children_named("connection")
            .next()
            .map(|c| Self::parse_connection(c, save_password, &id))
            .unwrap_or_default();
        let display_name = if name.is_empty() { id.clone() } else { name };
        let mut settings = DataSourceSettings::new(display_name, driver, connection);
        settings.save_password = save_password;
        settings.read_only = el.flag("read-only");
        settings.navigator = NavigatorSettings {
            show_system_objects: el.flag("show-system-objects"),
            show_utility_objects: el.flag("show-util-objects"),
            show_only_entities: el.flag("navigator-show-only-entities"),
            hide_folders: el.flag("navigator-hide-folders"),
            hide_schemas: el.flag("navigator-hide-schemas"),
            hide_virtual_model: el.flag("navigator-hide-virtual"),
            merge_entities: el.flag("navigator-merge-entities"),
        };
        settings.folder = el.non_empty("folder");
        settings.lock_password_hash = el.non_empty("lock-passwd");
        for (attr, object_type) in [("filter-catalog", "catalog"), ("filter-schema", "schema")] {
            if let Some(mask) = el.non_empty(attr) {
                settings.update_object_filter(ObjectFilter::new(object_type).including([mask]));
            }
        }

        for child in &el.children {
            match child.name.as_str() {
                "connection" => {
                    for sub in &child.children {
                        Self::apply_connection_child(sub, ctx, &mut settings.connection, &id);
                    }
                }
                "filters" => {
                    for filter in child.children_named("filter") {
                        Self::apply_filter(filter, &mut settings);
                    }
                }
                "filter" => Self::apply_filter(child, &mut settings),
                "custom-property" => {
                    if let Some(name) = child.attr("name") {
                        let value = child.attr("value").unwrap_or_default();
                        Self::apply_custom_property(name, value, &mut settings);
                    }
                }
                "description" => {
                    if !child.text.is_empty() {
                        settings.description = Some(child.text.clone());
                    }
                }
                "virtual-meta-data" => {
                    debug!(data_source = %id, "Skipping legacy virtual model");
                }
                other => debug!(data_source = %id, element = other, "Ignoring element"),
            }
        }

        Some(ParsedDataSource {
            id,
            origin: DataSourceOrigin::Local,
            settings,
            virtual_model: None,
            secrets_resolved: true,
            plaintext_credentials: false,
        })
    }

    fn apply_connection_child(
        el: &XmlElement,
        ctx: &ParseContext<'_>,
        config: &mut ConnectionConfiguration,
        ds_id: &str,
    ) {
        match el.name.as_str() {
            "property" => {
                let Some(name) = el.non_empty("name") else {
                    return;
                };
                let value = el.attr("value").unwrap_or_default().to_string();
                if name.starts_with(INTERNAL_PROP_PREFIX) {
                    config.provider_properties.insert(name, value);
                } else {
                    config.properties.insert(name, value);
                }
            }
            "provider-property" => {
                if let Some(name) = el.non_empty("name") {
                    let value = el.attr("value").unwrap_or_default().to_string();
                    config.provider_properties.insert(name, value);
                }
            }
            "event" => {
                if let Some((event_type, command)) = Self::parse_event(el) {
                    config.events.insert(event_type, command);
                }
            }
            "network-handler" => {
                if let Some(handler) = Self::parse_handler(el, ctx) {
                    config.update_handler(handler);
                }
            }
            "bootstrap" => Self::parse_bootstrap(el, config),
            other => debug!(data_source = ds_id, element = other, "Ignoring connection element"),
        }
    }

    fn apply_filter(el: &XmlElement, settings: &mut DataSourceSettings) {
        let filter = Self::parse_filter(el);
        if filter.object_type.is_some() {
            settings.update_object_filter(filter);
        }
    }
}

impl DataSourceSerializer for LegacySerializer {
    fn parse_data_sources(
        &self,
        storage: &ConfigurationStorage,
        content: &[u8],
        ctx: &ParseContext<'_>,
    ) -> Result<ParsedConfiguration> {
        let text = std::str::from_utf8(content)
            .map_err(|e| RegistryError::parse(storage.storage_id(), format!("Not UTF-8: {}", e)))?;
        let root = parse_tree(text).map_err(|e| RegistryError::parse(storage.storage_id(), e))?;
        if root.name != "data-sources" {
            return Err(RegistryError::parse(
                storage.storage_id(),
                format!("Unexpected root element <{}>", root.name),
            ));
        }

        let mut parsed = ParsedConfiguration {
            profile_secrets_resolved: true,
            ..ParsedConfiguration::default()
        };
        for child in &root.children {
            match child.name.as_str() {
                "folder" => parsed.folders.extend(Self::parse_folder(child)),
                "data-source" => parsed.data_sources.extend(Self::parse_data_source(child, ctx)),
                "filters" => parsed
                    .saved_filters
                    .extend(child.children_named("filter").map(Self::parse_filter)),
                "filter" => parsed.saved_filters.push(Self::parse_filter(child)),
                other => debug!(storage = %storage, element = other, "Ignoring element"),
            }
        }

        debug!(
            storage = %storage,
            data_sources = parsed.data_sources.len(),
            folders = parsed.folders.len(),
            "Parsed legacy configuration"
        );
        Ok(parsed)
    }

    fn save_data_sources(
        &self,
        storage: &ConfigurationStorage,
        _data: &SaveData<'_>,
    ) -> Result<SavedConfiguration> {
        Err(RegistryError::unsupported_feature(
            "save",
            storage.storage_id(),
        ))
    }
}

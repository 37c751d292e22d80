//! The XML format and the JSON format describe the same data sources the
//! same way, and converting one into the other loses nothing.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use dsregistry_core::network::NetworkHandlerRegistry;
use dsregistry_core::provider::DriverRegistry;
use dsregistry_core::serializer::{
    DataSourceSerializer, DataSourceSnapshot, LegacySerializer, ModernSerializer, ParseContext, ParsedConfiguration,
    SaveData, SecretsMode,
};
use dsregistry_core::{ConfigurationStorage, DataSourceDescriptor};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

// Passwords as legacy XML files obfuscate them
const TIGER_OBFUSCATED: &str = "Bw0BJVMjJA==";
const TUNNEL_SECRET_OBFUSCATED: &str = "BxEILkRPCQUAERQ7A3Yl";

struct Formats {
    drivers: DriverRegistry,
    handlers: NetworkHandlerRegistry,
    legacy: ConfigurationStorage,
    modern: ConfigurationStorage,
}

impl Formats {
    fn new() -> Self {
        Self {
            drivers: DriverRegistry::builtin(),
            handlers: NetworkHandlerRegistry::builtin(),
            legacy: ConfigurationStorage::from_path(Path::new("/project/.dbeaver/data-sources.xml")).unwrap(),
            modern: ConfigurationStorage::default_modern(Path::new("/project/.dbeaver")),
        }
    }

    fn context<'a>(&'a self, credentials: Option<&'a [u8]>) -> ParseContext<'a> {
        ParseContext {
            drivers: &self.drivers,
            network_handlers: &self.handlers,
            encryptor: None,
            credentials,
            secrets_mode: SecretsMode::CredentialsFile,
        }
    }

    fn parse_legacy(&self, xml: &str) -> ParsedConfiguration {
        LegacySerializer
            .parse_data_sources(&self.legacy, xml.as_bytes(), &self.context(None))
            .unwrap()
    }

    fn parse_modern(&self, config: &[u8], credentials: Option<&[u8]>) -> ParsedConfiguration {
        ModernSerializer
            .parse_data_sources(&self.modern, config, &self.context(credentials))
            .unwrap()
    }

    fn detached(&self, parsed: &ParsedConfiguration, index: usize) -> DataSourceDescriptor {
        let ds = &parsed.data_sources[index];
        DataSourceDescriptor::detached(ds.id.clone(), self.modern.clone(), ds.settings.clone())
    }
}

fn legacy_document() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<data-sources>
    <folder name="Production" description="Live systems"/>
    <folder name="Reports" parent="Production"/>
    <data-source id="pg-sales" provider="postgresql" driver="postgres-jdbc" name="Sales"
            save-password="true" read-only="true" show-system-objects="true" folder="Production/Reports"
            filter-schema="public">
        <connection host="db.internal" port="5432" database="sales" type="prod" keep-alive="30"
                user="scott" password="{password}">
            <property name="ssl" value="true"/>
            <property name="@dbeaver-default-resultset" value="1"/>
            <provider-property name="show-templates" value="false"/>
            <event type="BEFORE_CONNECT" enabled="true" wait-process="true" wait-process-timeout="5000">vpn up</event>
            <network-handler type="TUNNEL" id="ssh_tunnel" enabled="true" save-password="true"
                    user="jump" password="{tunnel}">
                <property name="host" value="bastion.internal"/>
                <property name="passphrase" value="pp"/>
            </network-handler>
            <bootstrap autocommit="false" txnIsolation="2" ignoreErrors="true">
                <query>SET search_path TO sales</query>
            </bootstrap>
        </connection>
        <filter type="table" name="Hide temp" enabled="false">
            <exclude name="tmp_%"/>
        </filter>
        <custom-property name="default.activeObject" value="sales"/>
        <custom-property name="resultset.maxrows" value="500"/>
        <description>Main &amp; only</description>
    </data-source>
    <data-source id="mysql-app" provider="mysql" driver="mysql8" name="App" folder="Production">
        <connection host="app.internal" port="3306" database="app" user="app"/>
    </data-source>
    <filters>
        <filter name="Only public"><include name="public"/></filter>
    </filters>
</data-sources>"#,
        password = TIGER_OBFUSCATED,
        tunnel = TUNNEL_SECRET_OBFUSCATED,
    )
}

fn modern_document() -> Vec<u8> {
    json!({
        "folders": {
            "Production": {"description": "Live systems"},
            "Reports": {"parent": "Production"}
        },
        "connections": {
            "pg-sales": {
                "provider": "postgresql",
                "driver": "postgres-jdbc",
                "name": "Sales",
                "save-password": true,
                "read-only": true,
                "show-system-objects": true,
                "folder": "Production/Reports",
                "description": "Main & only",
                "configuration": {
                    "host": "db.internal",
                    "port": "5432",
                    "database": "sales",
                    "type": "prod",
                    "keep-alive": 30,
                    "user": "scott",
                    "password": "tiger",
                    "properties": {"ssl": "true"},
                    "provider-properties": {
                        "@dbeaver-default-resultset": "1",
                        "show-templates": "false"
                    },
                    "events": {
                        "BEFORE_CONNECT": {
                            "command": "vpn up",
                            "enabled": true,
                            "wait-process": true,
                            "wait-process-timeout": 5000
                        }
                    },
                    "handlers": {
                        "ssh_tunnel": {
                            "type": "TUNNEL",
                            "enabled": true,
                            "save-password": true,
                            "user": "jump",
                            "password": "tunnel-secret",
                            "properties": {"host": "bastion.internal", "passphrase": "pp"}
                        }
                    },
                    "bootstrap": {
                        "autocommit": false,
                        "txnIsolation": 2,
                        "defaultObject": "sales",
                        "ignoreErrors": true,
                        "initQueries": ["SET search_path TO sales"]
                    }
                },
                "filters": [
                    {"type": "schema", "include": ["public"]},
                    {"type": "table", "name": "Hide temp", "enabled": false, "exclude": ["tmp_%"]}
                ],
                "custom-properties": {"resultset.maxrows": "500"}
            },
            "mysql-app": {
                "provider": "mysql",
                "driver": "mysql8",
                "name": "App",
                "folder": "Production",
                "configuration": {
                    "host": "app.internal",
                    "port": "3306",
                    "database": "app",
                    "user": "app"
                }
            }
        },
        "saved-filters": [
            {"name": "Only public", "include": ["public"]}
        ]
    })
    .to_string()
    .into_bytes()
}

fn assert_equivalent(formats: &Formats, left: &ParsedConfiguration, right: &ParsedConfiguration) {
    assert_eq!(left.folders, right.folders);
    assert_eq!(left.saved_filters, right.saved_filters);
    let left_ids: Vec<&str> = left.data_sources.iter().map(|d| d.id.as_str()).collect();
    let right_ids: Vec<&str> = right.data_sources.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(left_ids, right_ids);
    for index in 0..left.data_sources.len() {
        let a = formats.detached(left, index);
        let b = formats.detached(right, index);
        assert_eq!(a.settings(), b.settings(), "data source {} differs", a.id());
        assert!(a.equal_settings(&b));
    }
}

#[test]
fn test_legacy_and_modern_documents_agree() {
    let formats = Formats::new();
    let legacy = formats.parse_legacy(&legacy_document());
    let modern = formats.parse_modern(&modern_document(), None);

    assert_eq!(legacy.data_sources.len(), 2);
    assert_equivalent(&formats, &legacy, &modern);

    let sales = &legacy.data_sources[0].settings;
    assert_eq!(sales.connection.user_password.as_deref(), Some("tiger"));
    assert_eq!(
        sales.connection.handler("ssh_tunnel").unwrap().secure_properties["passphrase"],
        "pp"
    );
    assert_eq!(sales.connection.bootstrap.default_catalog.as_deref(), Some("sales"));
}

#[test]
fn test_migrated_document_parses_back_unchanged() {
    let formats = Formats::new();
    let legacy = formats.parse_legacy(&legacy_document());

    let snapshots: Vec<DataSourceSnapshot> = legacy
        .data_sources
        .iter()
        .map(|ds| DataSourceSnapshot {
            id: ds.id.clone(),
            origin: ds.origin.clone(),
            settings: ds.settings.clone(),
            virtual_model: ds.virtual_model.clone(),
            persist_secrets: true,
        })
        .collect();
    let external = BTreeMap::new();
    let data = SaveData {
        project_id: "General",
        data_sources: &snapshots,
        folders: &legacy.folders,
        network_profiles: &[],
        auth_profiles: &[],
        saved_filters: &legacy.saved_filters,
        connection_types: &[],
        custom_drivers: &[],
        external_configurations: &external,
        secrets_mode: SecretsMode::CredentialsFile,
        encryptor: None,
        encrypt_project: false,
        previous_credentials: None,
    };
    let saved = ModernSerializer.save_data_sources(&formats.modern, &data).unwrap();

    let config_text = String::from_utf8(saved.config.clone()).unwrap();
    assert!(!config_text.contains("tiger"));
    assert!(!config_text.contains("tunnel-secret"));

    let migrated = formats.parse_modern(&saved.config, saved.credentials.as_deref());
    assert_equivalent(&formats, &legacy, &migrated);
}

#[test]
fn test_legacy_format_is_read_only() {
    let formats = Formats::new();
    let external = BTreeMap::new();
    let data = SaveData {
        project_id: "General",
        data_sources: &[],
        folders: &[],
        network_profiles: &[],
        auth_profiles: &[],
        saved_filters: &[],
        connection_types: &[],
        custom_drivers: &[],
        external_configurations: &external,
        secrets_mode: SecretsMode::CredentialsFile,
        encryptor: None,
        encrypt_project: false,
        previous_credentials: None,
    };
    assert!(LegacySerializer.save_data_sources(&formats.legacy, &data).is_err());
}

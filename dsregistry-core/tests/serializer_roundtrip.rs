//! Property tests: whatever the JSON serializer writes, it reads back as
//! settings-equal descriptors.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use dsregistry_core::model::{ConnectionConfiguration, DataSourceFolder, NetworkHandlerConfiguration, NetworkHandlerType};
use dsregistry_core::network::NetworkHandlerRegistry;
use dsregistry_core::provider::DriverRegistry;
use dsregistry_core::security::encryption::ValueEncryptor;
use dsregistry_core::serializer::{
    DataSourceSerializer, DataSourceSnapshot, ModernSerializer, ParseContext, SaveData, SecretsMode,
};
use dsregistry_core::{ConfigurationStorage, DataSourceDescriptor, DataSourceOrigin, DataSourceSettings};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone)]
struct Sample {
    name: String,
    host: String,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    save_password: bool,
    read_only: bool,
    folder: Option<String>,
    properties: BTreeMap<String, String>,
    tunnel_password: Option<String>,
}

fn sample() -> impl Strategy<Value = Sample> {
    (
        "[A-Za-z][A-Za-z0-9 _-]{0,20}",
        "[a-z]{1,10}(\\.[a-z]{1,8}){0,2}",
        proptest::option::of(1u16..),
        proptest::option::of("[a-z_]{1,12}"),
        proptest::option::of("[a-z]{1,8}"),
        proptest::option::of("[!-~]{1,16}"),
        any::<bool>(),
        any::<bool>(),
        proptest::option::of("[A-Z][a-z]{0,6}(/[A-Z][a-z]{0,6})?"),
        proptest::collection::btree_map("[a-z.]{1,10}", "[!-~]{1,12}", 0..4),
        proptest::option::of("[!-~]{1,12}"),
    )
        .prop_map(
            |(name, host, port, database, user, password, save_password, read_only, folder, properties, tunnel_password)| {
                Sample {
                    name,
                    host,
                    port,
                    database,
                    user,
                    password,
                    save_password,
                    read_only,
                    folder,
                    properties,
                    tunnel_password,
                }
            },
        )
}

fn folders_for(path: Option<&str>) -> Vec<DataSourceFolder> {
    let mut folders = Vec::new();
    let mut parent: Option<String> = None;
    for name in path.into_iter().flat_map(|p| p.split('/')) {
        let folder = DataSourceFolder::new(name, parent.clone());
        parent = Some(folder.path());
        folders.push(folder);
    }
    folders
}

fn build(drivers: &DriverRegistry, sample: &Sample) -> DataSourceSnapshot {
    let mut connection = ConnectionConfiguration::new(sample.host.clone());
    connection.port = sample.port.map(|p| p.to_string());
    connection.database_name.clone_from(&sample.database);
    connection.user_name.clone_from(&sample.user);
    // Passwords are only persisted together with save_password
    connection.user_password = sample.password.clone().filter(|_| sample.save_password);
    connection.properties.clone_from(&sample.properties);
    if let Some(password) = &sample.tunnel_password {
        let mut tunnel = NetworkHandlerConfiguration::new("ssh_tunnel", NetworkHandlerType::Tunnel)
            .with_property("host", "bastion");
        tunnel.save_password = true;
        tunnel.password = Some(password.clone());
        connection.handlers.push(tunnel);
    }

    let mut settings = DataSourceSettings::new(
        sample.name.clone(),
        drivers.resolve_driver("postgresql", "postgres-jdbc"),
        connection,
    )
    .with_save_password(sample.save_password);
    settings.read_only = sample.read_only;
    settings.folder.clone_from(&sample.folder);

    DataSourceSnapshot {
        id: format!("postgres-jdbc-{}", sample.name.len()),
        origin: DataSourceOrigin::Local,
        settings,
        virtual_model: None,
        persist_secrets: true,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn saved_data_sources_parse_back_equal(sample in sample()) {
        let drivers = DriverRegistry::builtin();
        let handlers = NetworkHandlerRegistry::builtin();
        let storage = ConfigurationStorage::default_modern(Path::new("/project/.dbeaver"));
        let encryptor = ValueEncryptor::generate();

        let snapshots = vec![build(&drivers, &sample)];
        let folders = folders_for(sample.folder.as_deref());
        let external = BTreeMap::new();
        let data = SaveData {
            project_id: "General",
            data_sources: &snapshots,
            folders: &folders,
            network_profiles: &[],
            auth_profiles: &[],
            saved_filters: &[],
            connection_types: &[],
            custom_drivers: &[],
            external_configurations: &external,
            secrets_mode: SecretsMode::CredentialsFile,
            encryptor: Some(&encryptor),
            encrypt_project: false,
            previous_credentials: None,
        };
        let saved = ModernSerializer.save_data_sources(&storage, &data).unwrap();

        let ctx = ParseContext {
            drivers: &drivers,
            network_handlers: &handlers,
            encryptor: Some(&encryptor),
            credentials: saved.credentials.as_deref(),
            secrets_mode: SecretsMode::CredentialsFile,
        };
        let parsed = ModernSerializer.parse_data_sources(&storage, &saved.config, &ctx).unwrap();
        prop_assert_eq!(parsed.data_sources.len(), 1);
        prop_assert_eq!(&parsed.folders, &folders);

        let original = DataSourceDescriptor::detached(
            snapshots[0].id.clone(),
            storage.clone(),
            snapshots[0].settings.clone(),
        );
        let reloaded = DataSourceDescriptor::detached(
            parsed.data_sources[0].id.clone(),
            storage,
            parsed.data_sources[0].settings.clone(),
        );
        prop_assert!(original.equal_settings(&reloaded));
    }
}

//! Reloading a storage drops data sources its file no longer lists,
//! except those that never came from the file.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use dsregistry_core::provider::DriverRegistry;
use dsregistry_core::secrets::{SecretRecord, data_source_key, read_record, write_record};
use dsregistry_core::{
    ChannelListener, ConnectionConfiguration, DataSourceOrigin, DataSourceRegistry, DataSourceSettings,
    MemorySecretController, RegistryConfig, RegistryEvent, RegistryServices,
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn entry(name: &str) -> Value {
    json!({
        "provider": "postgresql",
        "driver": "postgres-jdbc",
        "name": name,
        "configuration": {"host": "db.internal", "port": "5432"}
    })
}

fn write_config(dir: &Path, connections: Value) {
    let metadata = dir.join(".dbeaver");
    std::fs::create_dir_all(&metadata).unwrap();
    let config = json!({ "connections": connections });
    std::fs::write(metadata.join("data-sources.json"), config.to_string()).unwrap();
}

fn config(dir: &Path) -> RegistryConfig {
    // Long enough that no background save rewrites the file under test
    RegistryConfig::new(dir)
        .with_secret_storage(true)
        .with_save_delay(Duration::from_secs(60))
}

fn ids(registry: &DataSourceRegistry) -> Vec<String> {
    let mut ids: Vec<String> = registry.data_sources().iter().map(|d| d.id().to_string()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_reload_purges_omitted_data_sources() {
    let dir = tempfile::tempdir().unwrap();
    let mut external = entry("Cloud");
    external["origin"] = json!({"type": "cloud", "region": "eu-west-1"});
    write_config(
        dir.path(),
        json!({
            "pg-a": entry("A"),
            "pg-b": entry("B"),
            "pg-cloud": external,
        }),
    );

    let controller = Arc::new(MemorySecretController::new());
    let record = SecretRecord {
        user: Some("scott".to_string()),
        password: Some("tiger".to_string()),
        ..SecretRecord::default()
    };
    write_record(controller.as_ref(), &data_source_key("General", "pg-b"), &record)
        .await
        .unwrap();

    let registry = DataSourceRegistry::open(
        config(dir.path()),
        RegistryServices::new().with_secret_controller(controller.clone()),
    )
    .await
    .unwrap();
    assert_eq!(ids(&registry), ["pg-a", "pg-b", "pg-cloud"]);
    assert!(matches!(
        registry.data_source("pg-cloud").unwrap().origin(),
        DataSourceOrigin::External { kind, .. } if kind == "cloud"
    ));

    let driver = DriverRegistry::builtin().resolve_driver("postgresql", "postgres-jdbc");
    let hosted = registry
        .new_data_source_with_id(
            "host-pg",
            DataSourceSettings::new("Hosted", driver, ConnectionConfiguration::new("localhost")),
        )
        .provided();
    registry.add_data_source(hosted).unwrap();

    let (listener, mut events) = ChannelListener::channel();
    registry.add_listener(listener);
    write_config(dir.path(), json!({ "pg-a": entry("A renamed") }));

    let summary = registry.reload().await.unwrap().expect("no save is running");
    let outcome = &summary.outcomes["data-sources.json"];
    assert_eq!(outcome.updated, ["pg-a"]);
    assert_eq!(outcome.removed, ["pg-b"]);
    assert!(outcome.added.is_empty());
    assert!(outcome.changed());

    assert_eq!(ids(&registry), ["host-pg", "pg-a", "pg-cloud"]);
    assert_eq!(registry.data_source("pg-a").unwrap().name(), "A renamed");

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(received.contains(&RegistryEvent::Updated { id: "pg-a".to_string() }));
    assert!(received.contains(&RegistryEvent::Removed { id: "pg-b".to_string() }));
    assert!(!received.iter().any(|e| e.data_source_id() == Some("pg-cloud")));

    // Purged entries keep their stored secrets; an explicit remove deletes them
    let key = data_source_key("General", "pg-b");
    assert!(read_record(controller.as_ref(), &key).await.unwrap().is_some());
    registry.dispose().await;
}

#[tokio::test]
async fn test_filtered_parse_only_touches_listed_ids() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        json!({
            "pg-a": entry("A"),
            "pg-b": entry("B"),
            "pg-c": entry("C"),
        }),
    );
    let registry = DataSourceRegistry::open(config(dir.path()), RegistryServices::new())
        .await
        .unwrap();

    write_config(dir.path(), json!({ "pg-c": entry("C") }));
    let storage = registry.config().default_storage();
    let only_a: HashSet<String> = ["pg-a".to_string()].into();
    let outcome = registry
        .parse_storage(&storage, Some(&only_a), true)
        .await
        .unwrap();

    assert_eq!(outcome.removed, ["pg-a"]);
    assert_eq!(ids(&registry), ["pg-b", "pg-c"]);
    registry.dispose().await;
}

#[tokio::test]
async fn test_unchanged_reload_reports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), json!({ "pg-a": entry("A") }));
    let registry = DataSourceRegistry::open(config(dir.path()), RegistryServices::new())
        .await
        .unwrap();

    let summary = registry.reload().await.unwrap().unwrap();
    let outcome = &summary.outcomes["data-sources.json"];
    assert_eq!(outcome.untouched, ["pg-a"]);
    assert!(!outcome.changed());
    registry.dispose().await;
}

#[tokio::test]
async fn test_deleted_file_purges_everything_file_backed() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), json!({ "pg-a": entry("A"), "pg-b": entry("B") }));
    let registry = DataSourceRegistry::open(config(dir.path()), RegistryServices::new())
        .await
        .unwrap();

    std::fs::remove_file(dir.path().join(".dbeaver/data-sources.json")).unwrap();
    let summary = registry.reload().await.unwrap().unwrap();
    let mut removed = summary.outcomes["data-sources.json"].removed.clone();
    removed.sort();
    assert_eq!(removed, ["pg-a", "pg-b"]);
    assert!(registry.data_sources().is_empty());
    registry.dispose().await;
}

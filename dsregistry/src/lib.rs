//! Library module for the `dsregistry` command line tool.
//!
//! Argument definitions and command implementations live here so the
//! integration tests can drive them without spawning the binary. Command
//! output goes to a caller-supplied writer; logs go to stderr.

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use dsregistry_core::auth::{AuthPrompt, CredentialRequest};
use dsregistry_core::error::redact_database_url;
use dsregistry_core::provider::{DataSourceProvider, SocketProbeProvider};
use dsregistry_core::security::encryption::ValueEncryptor;
use dsregistry_core::security::{Credentials, parse_connection_url};
use dsregistry_core::{
    DataSourceDescriptor, DataSourceRegistry, DataSourceSettings, FileSecretController,
    RegistryConfig, RegistryServices,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Vault file name inside the metadata folder.
pub const VAULT_FILE_NAME: &str = "secure-storage.vault";

/// Vault key holding the project key used for the credentials file.
const PROJECT_KEY_SECRET: &str = "project-key";

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "dsregistry")]
#[command(about = "Inspect and edit a project's data source registry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = "
dsregistry - data source registry tool

Reads the connection definitions of a project (.dbeaver/data-sources*.json,
or legacy data-sources*.xml), lets you add, remove and test them, and keeps
their passwords out of the plain configuration file.

SECRETS:
- With a master password, secrets go to an encrypted vault in the
  metadata folder
- Without one, secrets go to credentials-config.json, encrypted when a
  project key is supplied

EXAMPLES:
  dsregistry --project ~/work list
  dsregistry add --name Sales --url postgres://app@db:5432/sales
  dsregistry test postgres-jdbc-18c2a3f1e2d-5b7e0a11
")]
pub struct Cli {
    /// Logging flags
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Project selection
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Logging flags shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    pub quiet: bool,
}

/// Which project to open and how to reach its secrets.
#[derive(Debug, Args)]
pub struct ProjectArgs {
    /// Project root directory
    #[arg(long, global = true, env = "DSREGISTRY_PROJECT", default_value = ".")]
    pub project: PathBuf,

    /// JSON file with registry settings
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Master password for the secret vault
    #[arg(long, global = true, env = "DSREGISTRY_MASTER_PASSWORD", hide_env_values = true)]
    pub master_password: Option<String>,

    /// Base64 project key for the credentials file
    #[arg(long, global = true, env = "DSREGISTRY_PROJECT_KEY", hide_env_values = true)]
    pub project_key: Option<String>,

    /// Resolve ${VAR} references from the environment
    #[arg(long, global = true)]
    pub env_variables: bool,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List data sources
    List {
        /// Only data sources in this folder
        #[arg(long)]
        folder: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one data source
    Show {
        /// Data source id or name
        id: String,
    },
    /// Add a data source from a connection URL
    Add(AddArgs),
    /// Remove a data source and its secrets
    Remove {
        /// Data source id or name
        id: String,
    },
    /// Print the folder tree
    Folders,
    /// Convert legacy XML configuration to JSON
    Migrate,
    /// Connect to a data source and report the result
    Test {
        /// Data source id or name
        id: String,

        /// Connect timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Manage saved credentials
    #[command(subcommand)]
    Secrets(SecretsCommand),
}

/// Arguments of `add`.
#[derive(Debug, Args)]
pub struct AddArgs {
    /// Connection URL (credentials are moved out of the configuration)
    #[arg(long)]
    pub url: String,

    /// Display name
    #[arg(long)]
    pub name: Option<String>,

    /// Explicit data source id
    #[arg(long)]
    pub id: Option<String>,

    /// Folder path
    #[arg(long)]
    pub folder: Option<String>,

    /// Driver as `provider/driver`; defaults to the URL scheme's driver
    #[arg(long)]
    pub driver: Option<String>,

    /// Connection type id (dev, test, prod, ...)
    #[arg(long)]
    pub connection_type: Option<String>,

    /// Do not store the password
    #[arg(long)]
    pub no_save_password: bool,
}

/// `secrets` subcommands.
#[derive(Debug, Subcommand)]
pub enum SecretsCommand {
    /// Store credentials for a data source
    Set {
        /// Data source id or name
        id: String,

        /// User name
        #[arg(long)]
        user: Option<String>,

        /// Password; prompted for when omitted
        #[arg(long, env = "DSREGISTRY_SECRET_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Drop saved credentials of a data source
    Forget {
        /// Data source id or name
        id: String,
    },
}

/// Terminal prompt for credentials, used when a data source does not save
/// its password.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

#[async_trait]
impl AuthPrompt for TerminalPrompt {
    async fn prompt_credentials(
        &self,
        request: &CredentialRequest,
    ) -> dsregistry_core::Result<Option<Credentials>> {
        let prompt = format!("{}: password: ", request.prompt);
        let user = request.user_name.clone().unwrap_or_default();
        let read = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt)).await;
        match read {
            Ok(Ok(password)) if !password.is_empty() => Ok(Some(Credentials::new(user, Some(password)))),
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => {
                warn!(error = %e, "Cannot read password from terminal");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Password prompt task failed");
                Ok(None)
            }
        }
    }
}

/// Builds the registry configuration from arguments and the optional
/// settings file.
///
/// # Errors
/// Returns an error if the settings file cannot be read
pub async fn build_config(args: &ProjectArgs) -> anyhow::Result<RegistryConfig> {
    let mut config = match &args.config {
        Some(path) => RegistryConfig::from_file(path)
            .await
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => RegistryConfig::default(),
    };
    config.project_root.clone_from(&args.project);
    if args.env_variables {
        config.use_env_variables = true;
    }
    config.use_secret_storage = args.master_password.is_some();
    config.validate().context("Invalid registry settings")?;
    Ok(config)
}

/// Builds collaborators: the vault when a master password is given, the
/// project key, the terminal prompt and the socket probe as default
/// provider.
///
/// # Errors
/// Returns an error if the vault cannot be opened or the project key is
/// malformed
pub async fn build_services(args: &ProjectArgs, config: &RegistryConfig) -> anyhow::Result<RegistryServices> {
    let mut services = RegistryServices::new().with_auth_prompt(Arc::new(TerminalPrompt));
    let probe: Arc<dyn DataSourceProvider> = Arc::new(SocketProbeProvider::default());
    services.drivers.set_default_implementation(&probe);

    if let Some(key) = &args.project_key {
        services = services.with_encryptor(ValueEncryptor::from_base64(key).context("Invalid project key")?);
    }

    if let Some(master) = &args.master_password {
        let master = Zeroizing::new(master.clone());
        let path = config.metadata_dir().join(VAULT_FILE_NAME);
        let vault = FileSecretController::open(&path, &master)
            .await
            .with_context(|| format!("Failed to open secret vault {}", path.display()))?;
        if args.project_key.is_none() {
            services = services.with_encryptor(project_key_from_vault(&vault).await?);
        }
        services = services.with_secret_controller(Arc::new(vault));
    } else if args.project_key.is_none() {
        debug!("No master password or project key, credentials file is stored unencrypted");
    }
    Ok(services)
}

async fn project_key_from_vault(vault: &FileSecretController) -> anyhow::Result<ValueEncryptor> {
    use dsregistry_core::SecretController;

    if let Some(stored) = vault.get(PROJECT_KEY_SECRET).await? {
        return ValueEncryptor::from_base64(&stored).context("Vault holds a malformed project key");
    }
    let encryptor = ValueEncryptor::generate();
    vault
        .set(PROJECT_KEY_SECRET, Some(encryptor.export_key().as_str().to_string()))
        .await?;
    vault.flush().await?;
    info!("Generated project key");
    Ok(encryptor)
}

/// Row printed by `list`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DataSourceSummary {
    /// Data source id
    pub id: String,
    /// Display name
    pub name: String,
    /// `provider/driver`
    pub driver: String,
    /// Folder path
    pub folder: Option<String>,
    /// Host or file
    pub host: Option<String>,
    /// Database name
    pub database: Option<String>,
    /// User name
    pub user: Option<String>,
    /// Password is saved
    pub save_password: bool,
    /// Storage file
    pub storage: String,
}

impl DataSourceSummary {
    /// Summarizes a descriptor without any secret value.
    pub fn from_descriptor(descriptor: &DataSourceDescriptor) -> Self {
        let settings = descriptor.settings();
        Self {
            id: descriptor.id().to_string(),
            name: settings.name,
            driver: settings.driver.full_id(),
            folder: settings.folder,
            host: settings.connection.host,
            database: settings.connection.database_name,
            user: settings.connection.user_name,
            save_password: settings.save_password,
            storage: descriptor.storage().storage_id().to_string(),
        }
    }
}

fn find(registry: &DataSourceRegistry, id_or_name: &str) -> anyhow::Result<Arc<DataSourceDescriptor>> {
    registry
        .data_source(id_or_name)
        .or_else(|| registry.find_data_source_by_name(id_or_name))
        .with_context(|| format!("Data source '{}' not found", id_or_name))
}

/// Runs a command against an opened registry.
///
/// # Errors
/// Returns an error if the command fails or output cannot be written
pub async fn execute(registry: &DataSourceRegistry, command: &Command, out: &mut dyn Write) -> anyhow::Result<()> {
    match command {
        Command::List { folder, json } => list(registry, folder.as_deref(), *json, out),
        Command::Show { id } => show(registry, id, out).await,
        Command::Add(args) => add(registry, args, out).await,
        Command::Remove { id } => {
            let descriptor = find(registry, id)?;
            registry.remove_data_source(descriptor.id()).await;
            registry.save_now().await?;
            writeln!(out, "Removed {}", descriptor.id())?;
            Ok(())
        }
        Command::Folders => folders(registry, out),
        Command::Migrate => {
            // Loading already converts legacy files; save once more so the
            // command also rewrites an existing JSON configuration.
            registry.save_now().await?;
            writeln!(
                out,
                "{} data sources saved to {}",
                registry.data_sources().len(),
                registry.config().default_storage().path().display()
            )?;
            Ok(())
        }
        Command::Test { id, timeout } => test(registry, id, Duration::from_secs(*timeout), out).await,
        Command::Secrets(SecretsCommand::Set { id, user, password }) => {
            set_secret(registry, id, user.clone(), password.clone(), out).await
        }
        Command::Secrets(SecretsCommand::Forget { id }) => {
            let descriptor = find(registry, id)?;
            registry.clear_saved_credentials(descriptor.id()).await?;
            writeln!(out, "Forgot credentials of {}", descriptor.id())?;
            Ok(())
        }
    }
}

fn list(registry: &DataSourceRegistry, folder: Option<&str>, json: bool, out: &mut dyn Write) -> anyhow::Result<()> {
    let descriptors = match folder {
        Some(folder) => registry.data_sources_in_folder(Some(folder)),
        None => registry.data_sources(),
    };
    let rows: Vec<DataSourceSummary> = descriptors
        .iter()
        .map(|d| DataSourceSummary::from_descriptor(d))
        .collect();
    if json {
        serde_json::to_writer_pretty(&mut *out, &rows)?;
        writeln!(out)?;
        return Ok(());
    }
    for row in &rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            row.id,
            row.name,
            row.driver,
            row.folder.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

async fn show(registry: &DataSourceRegistry, id: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    let descriptor = find(registry, id)?;
    descriptor.resolve_secrets_if_needed().await;
    let settings = descriptor.settings();
    let connection = &settings.connection;
    let connection_type = registry
        .connection_types()
        .connection_type(connection.connection_type.as_deref());

    writeln!(out, "id:              {}", descriptor.id())?;
    writeln!(out, "name:            {}", settings.name)?;
    writeln!(out, "driver:          {}", settings.driver.full_id())?;
    writeln!(out, "storage:         {}", descriptor.storage())?;
    writeln!(out, "folder:          {}", settings.folder.as_deref().unwrap_or("-"))?;
    writeln!(out, "connection type: {}", connection_type.name)?;
    if let Some(url) = &connection.url {
        writeln!(out, "url:             {}", redact_database_url(url))?;
    }
    writeln!(out, "host:            {}", connection.host.as_deref().unwrap_or("-"))?;
    writeln!(out, "port:            {}", connection.port.as_deref().unwrap_or("-"))?;
    writeln!(out, "database:        {}", connection.database_name.as_deref().unwrap_or("-"))?;
    writeln!(out, "user:            {}", connection.user_name.as_deref().unwrap_or("-"))?;
    writeln!(
        out,
        "password:        {}",
        if connection.user_password.is_some() { "saved" } else { "not saved" }
    )?;
    writeln!(out, "read only:       {}", settings.read_only)?;
    for handler in &connection.handlers {
        writeln!(
            out,
            "handler:         {} ({}, {})",
            handler.id,
            handler.handler_type,
            if handler.enabled { "enabled" } else { "disabled" }
        )?;
    }
    writeln!(out, "state:           {}", descriptor.connection_state())?;
    Ok(())
}

async fn add(registry: &DataSourceRegistry, args: &AddArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let (parsed, credentials) = parse_connection_url(&args.url)?;
    let driver = match &args.driver {
        Some(full_id) => {
            let (provider, driver) = full_id
                .split_once('/')
                .with_context(|| format!("Driver '{}' is not of the form provider/driver", full_id))?;
            registry
                .drivers()
                .find_driver(provider, driver)
                .with_context(|| format!("Unknown driver '{}'", full_id))?
        }
        None => registry
            .drivers()
            .find_driver_for_scheme(&parsed.scheme)
            .with_context(|| format!("No driver for URL scheme '{}'", parsed.scheme))?,
    };

    let mut connection = parsed.configuration;
    connection.apply_credentials(&credentials);
    connection.connection_type.clone_from(&args.connection_type);
    let name = args
        .name
        .clone()
        .or_else(|| connection.database_name.clone())
        .or_else(|| connection.host.clone())
        .unwrap_or_else(|| driver.name.clone());
    let mut settings = DataSourceSettings::new(name, driver, connection).with_save_password(!args.no_save_password);
    settings.folder.clone_from(&args.folder);
    if args.no_save_password {
        settings.connection.user_password = None;
    }

    let descriptor = match &args.id {
        Some(id) => registry.new_data_source_with_id(id.clone(), settings),
        None => registry.new_data_source(settings),
    };
    let descriptor = registry.add_data_source(descriptor)?;
    registry.save_now().await?;
    info!(data_source = %descriptor.id(), url = %redact_database_url(&args.url), "Data source added");
    writeln!(out, "{}", descriptor.id())?;
    Ok(())
}

fn folders(registry: &DataSourceRegistry, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut folders = registry.folders();
    folders.sort_by_key(dsregistry_core::DataSourceFolder::path);
    for folder in folders {
        let path = folder.path();
        let depth = path.matches(dsregistry_core::model::FOLDER_PATH_SEPARATOR).count();
        let count = registry.data_sources_in_folder(Some(&path)).len();
        write!(out, "{}{} ({})", "  ".repeat(depth), folder.name, count)?;
        match &folder.description {
            Some(description) => writeln!(out, " - {}", description)?,
            None => writeln!(out)?,
        }
    }
    Ok(())
}

async fn test(registry: &DataSourceRegistry, id: &str, timeout: Duration, out: &mut dyn Write) -> anyhow::Result<()> {
    let descriptor = find(registry, id)?;
    info!(data_source = %descriptor.id(), "Testing connection");
    let connected = match tokio::time::timeout(timeout, descriptor.connect()).await {
        Ok(result) => result?,
        Err(_) => bail!("Connection to '{}' timed out after {:?}", descriptor.name(), timeout),
    };
    if !connected {
        bail!("Connection to '{}' was cancelled", descriptor.name());
    }
    let server = descriptor.server_description().unwrap_or_default();
    descriptor.disconnect().await;
    writeln!(out, "Connection to '{}' successful ({})", descriptor.name(), server)?;
    Ok(())
}

async fn set_secret(
    registry: &DataSourceRegistry,
    id: &str,
    user: Option<String>,
    password: Option<String>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let descriptor = find(registry, id)?;
    let password = match password {
        Some(password) => Zeroizing::new(password),
        None => {
            let prompt = format!("Password for '{}': ", descriptor.name());
            Zeroizing::new(
                tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
                    .await?
                    .context("Failed to read password")?,
            )
        }
    };
    if password.is_empty() {
        bail!("Password cannot be empty");
    }

    descriptor.resolve_secrets_if_needed().await;
    descriptor.update_settings(|s| {
        s.save_password = true;
        if user.is_some() {
            s.connection.user_name.clone_from(&user);
        }
        s.connection.user_password = Some(password.to_string());
    });
    registry.update_data_source(descriptor.id())?;
    registry.save_now().await?;
    writeln!(out, "Saved credentials of {}", descriptor.id())?;
    Ok(())
}

/// Opens the project and runs the parsed command line.
///
/// # Errors
/// Returns an error if the project cannot be loaded or the command fails
pub async fn run(cli: &Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let config = build_config(&cli.project).await?;
    let services = build_services(&cli.project, &config).await?;
    let registry = DataSourceRegistry::new(config, services)?;
    let summary = registry
        .load()
        .await
        .with_context(|| format!("Failed to load project {}", cli.project.project.display()))?;
    if summary.migrated {
        info!("Converted legacy configuration to JSON");
    }
    let result = execute(&registry, &cli.command, out).await;
    registry.dispose().await;
    result
}

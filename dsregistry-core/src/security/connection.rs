//! Connection URL parsing with credential extraction.
//!
//! # Security
//! - User name and password are moved straight into [`Credentials`]
//! - The returned configuration never carries the password
//! - Errors never echo the input URL

use super::credentials::Credentials;
use crate::error::RegistryError;
use crate::model::ConnectionConfiguration;

/// Result of splitting a connection URL.
#[derive(Debug, Clone)]
pub struct ParsedConnectionUrl {
    /// URL scheme (`postgres`, `mysql`, `sqlite`, ...)
    pub scheme: String,
    /// Host, port, database and query parameters as driver properties
    pub configuration: ConnectionConfiguration,
}

/// Parses a database URL into a configuration and separate credentials.
///
/// Query parameters become driver properties. For `sqlite:` URLs the path
/// is taken as the database file.
///
/// # Errors
/// Returns error if the URL is malformed or a network URL has no host
///
/// # Example
/// ```rust
/// use dsregistry_core::security::parse_connection_url;
///
/// let (parsed, creds) = parse_connection_url("postgres://app:pw@db:5432/sales?sslmode=require")?;
/// assert_eq!(parsed.scheme, "postgres");
/// assert_eq!(parsed.configuration.host.as_deref(), Some("db"));
/// assert_eq!(parsed.configuration.properties["sslmode"], "require");
/// assert_eq!(creds.username(), "app");
/// assert!(parsed.configuration.user_password.is_none());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn parse_connection_url(
    connection_url: &str,
) -> crate::Result<(ParsedConnectionUrl, Credentials)> {
    let url = url::Url::parse(connection_url).map_err(|e| {
        RegistryError::configuration(format!("Invalid connection URL format: {}", e))
    })?;
    let scheme = url.scheme().to_ascii_lowercase();

    let mut configuration = ConnectionConfiguration::default();
    if scheme == "sqlite" {
        let path = match url.host_str() {
            Some(host) if !host.is_empty() => format!("{}{}", host, url.path()),
            _ => url.path().to_string(),
        };
        if path.is_empty() {
            return Err(RegistryError::configuration("Missing database file in connection URL"));
        }
        configuration.database_name = Some(path);
    } else {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RegistryError::configuration("Missing host in connection URL"))?;
        configuration.host = Some(host.to_string());
        configuration.port = url.port().map(|p| p.to_string());
        let database = url.path().trim_start_matches('/');
        if !database.is_empty() {
            configuration.database_name = Some(database.to_string());
        }
    }
    for (name, value) in url.query_pairs() {
        configuration
            .properties
            .insert(name.into_owned(), value.into_owned());
    }

    let credentials = Credentials::new(
        url.username().to_string(),
        url.password().map(str::to_string),
    );
    if !url.username().is_empty() {
        configuration.user_name = Some(url.username().to_string());
    }

    Ok((
        ParsedConnectionUrl {
            scheme,
            configuration,
        },
        credentials,
    ))
}

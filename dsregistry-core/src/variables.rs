//! `${name}` variable substitution in connection settings.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::model::ConnectionConfiguration;

/// Variable names understood in connection settings.
pub mod names {
    /// Host name
    pub const HOST: &str = "host";
    /// Port
    pub const PORT: &str = "port";
    /// Server name
    pub const SERVER: &str = "server";
    /// Database name
    pub const DATABASE: &str = "database";
    /// User name
    pub const USER: &str = "user";
    /// Password
    pub const PASSWORD: &str = "password";
    /// Connection URL
    pub const URL: &str = "url";
    /// Connection type id
    pub const CONN_TYPE: &str = "conn_type";
}

fn variable_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").ok())
        .as_ref()
}

/// Resolves variable names to values.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    values: BTreeMap<String, String>,
    use_environment: bool,
}

impl VariableResolver {
    /// Builds the variable set from a configuration: connection fields
    /// first, then driver properties (which never shadow fields).
    pub fn for_connection(config: &ConnectionConfiguration, use_environment: bool) -> Self {
        let mut values = BTreeMap::new();
        let fields = [
            (names::HOST, &config.host),
            (names::PORT, &config.port),
            (names::SERVER, &config.server_name),
            (names::DATABASE, &config.database_name),
            (names::USER, &config.user_name),
            (names::PASSWORD, &config.user_password),
            (names::URL, &config.url),
            (names::CONN_TYPE, &config.connection_type),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                values.insert(name.to_string(), value.clone());
            }
        }
        for (name, value) in &config.properties {
            values.entry(name.clone()).or_insert_with(|| value.clone());
        }
        Self {
            values,
            use_environment,
        }
    }

    /// Looks a variable up.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned().or_else(|| {
            if self.use_environment {
                std::env::var(name).ok()
            } else {
                None
            }
        })
    }

    /// Replaces every known `${name}` in `text`; unknown ones stay as-is.
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("${") {
            return text.to_string();
        }
        let Some(pattern) = variable_pattern() else {
            return text.to_string();
        };
        pattern
            .replace_all(text, |caps: &Captures<'_>| {
                self.resolve(&caps[1]).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn substitute_opt(&self, value: &mut Option<String>) {
        if let Some(text) = value.as_mut() {
            *text = self.substitute(text);
        }
    }
}

/// Substitutes variables in every user-editable field of a resolved
/// configuration: address fields, driver properties, handler properties
/// and event commands.
pub fn substitute_configuration(config: &mut ConnectionConfiguration, use_environment: bool) {
    let resolver = VariableResolver::for_connection(config, use_environment);
    resolver.substitute_opt(&mut config.host);
    resolver.substitute_opt(&mut config.port);
    resolver.substitute_opt(&mut config.server_name);
    resolver.substitute_opt(&mut config.database_name);
    resolver.substitute_opt(&mut config.url);
    for value in config.properties.values_mut() {
        *value = resolver.substitute(value);
    }
    for handler in &mut config.handlers {
        for value in handler.properties.values_mut() {
            *value = resolver.substitute(value);
        }
    }
    for command in config.events.values_mut() {
        command.command = resolver.substitute(&command.command);
        resolver.substitute_opt(&mut command.working_directory);
    }
}

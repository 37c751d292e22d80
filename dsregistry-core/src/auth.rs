//! Credential sources consulted while connecting.
//!
//! Three seams feed credentials into a connect attempt, in this order:
//! the data source's external origin (when it is dynamic), a global
//! [`CredentialProvider`], and finally an interactive [`AuthPrompt`] when
//! the password is not saved.

use async_trait::async_trait;

use crate::Result;
use crate::model::ConnectionConfiguration;
use crate::security::Credentials;

/// Global credential source (environment, SSO agent, ...).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fills credentials into `config`. Returns true if it supplied any.
    ///
    /// # Errors
    /// Returns error if the source failed; the connect attempt fails too
    async fn provide_credentials(
        &self,
        data_source_id: &str,
        config: &mut ConnectionConfiguration,
    ) -> Result<bool>;
}

/// What the prompt shows to the user.
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    /// Data source id
    pub data_source_id: String,
    /// Data source display name
    pub data_source_name: String,
    /// Pre-filled user name
    pub user_name: Option<String>,
    /// Prompt text
    pub prompt: String,
}

/// Interactive credential prompt.
#[async_trait]
pub trait AuthPrompt: Send + Sync {
    /// Asks for credentials. `None` means the user cancelled.
    ///
    /// # Errors
    /// Returns error if the prompt could not be shown
    async fn prompt_credentials(&self, request: &CredentialRequest) -> Result<Option<Credentials>>;
}

/// Provenance of externally supplied data sources.
#[async_trait]
pub trait ExternalOrigin: Send + Sync {
    /// Origin type id, matched against the persisted origin `type`.
    fn id(&self) -> &str;

    /// Dynamic origins hand out fresh credentials on every connect.
    fn is_dynamic(&self) -> bool;

    /// Writes current credentials into `config`.
    ///
    /// # Errors
    /// Returns error if the origin cannot supply credentials
    async fn resolve_credentials(
        &self,
        data_source_id: &str,
        config: &mut ConnectionConfiguration,
    ) -> Result<()>;
}

/// Provider that never supplies anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentialProvider;

#[async_trait]
impl CredentialProvider for NoCredentialProvider {
    async fn provide_credentials(
        &self,
        _data_source_id: &str,
        _config: &mut ConnectionConfiguration,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Prompt that always cancels; used when running non-interactively.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractivePrompt;

#[async_trait]
impl AuthPrompt for NonInteractivePrompt {
    async fn prompt_credentials(&self, _request: &CredentialRequest) -> Result<Option<Credentials>> {
        Ok(None)
    }
}

/// Reads `{prefix}USER` and `{prefix}PASSWORD` from the environment.
///
/// With prefix `PG` the variables are `PGUSER` and `PGPASSWORD`.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    prefix: String,
}

impl EnvCredentialProvider {
    /// Creates a provider reading variables with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn provide_credentials(
        &self,
        _data_source_id: &str,
        config: &mut ConnectionConfiguration,
    ) -> Result<bool> {
        let user = std::env::var(format!("{}USER", self.prefix)).ok();
        let password = std::env::var(format!("{}PASSWORD", self.prefix)).ok();
        if user.is_none() && password.is_none() {
            return Ok(false);
        }
        if user.is_some() {
            config.user_name = user;
        }
        if password.is_some() {
            config.user_password = password;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_provider_reads_prefixed_variables() {
        temp_env::with_vars(
            [
                ("DSREG_TEST_USER", Some("scott")),
                ("DSREG_TEST_PASSWORD", Some("tiger")),
            ],
            || {
                let mut config = ConnectionConfiguration::new("db");
                let supplied = futures::executor::block_on(
                    EnvCredentialProvider::new("DSREG_TEST_").provide_credentials("pg-1", &mut config),
                )
                .unwrap();

                assert!(supplied);
                assert_eq!(config.user_name.as_deref(), Some("scott"));
                assert_eq!(config.user_password.as_deref(), Some("tiger"));
            },
        );
    }

    #[test]
    fn test_env_provider_without_variables() {
        temp_env::with_vars(
            [
                ("DSREG_EMPTY_USER", None::<&str>),
                ("DSREG_EMPTY_PASSWORD", None),
            ],
            || {
                let mut config = ConnectionConfiguration::new("db").with_credentials("kept", None);
                let supplied = futures::executor::block_on(
                    EnvCredentialProvider::new("DSREG_EMPTY_").provide_credentials("pg-1", &mut config),
                )
                .unwrap();

                assert!(!supplied);
                assert_eq!(config.user_name.as_deref(), Some("kept"));
            },
        );
    }

    #[tokio::test]
    async fn test_non_interactive_prompt_cancels() {
        let request = CredentialRequest {
            data_source_id: "pg-1".to_string(),
            data_source_name: "Orders".to_string(),
            user_name: None,
            prompt: "Password".to_string(),
        };
        assert!(NonInteractivePrompt.prompt_credentials(&request).await.unwrap().is_none());
    }
}

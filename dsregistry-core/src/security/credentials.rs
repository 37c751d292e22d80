//! Secure credential container with automatic memory zeroing.
//!
//! Credentials travel between prompts, credential providers and the
//! connection configuration inside [`Credentials`], whose buffers are
//! cleared when the value is dropped.

use zeroize::{Zeroize, Zeroizing};

/// Secure credential container that automatically zeros memory on drop.
///
/// # Example
///
/// ```rust
/// use dsregistry_core::security::Credentials;
///
/// let creds = Credentials::new("admin".to_string(), Some("secret".to_string()));
/// assert_eq!(creds.username(), "admin");
/// assert!(creds.has_password());
/// assert!(!format!("{creds:?}").contains("secret"));
/// ```
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Credentials {
    username: Zeroizing<String>,
    password: Zeroizing<Option<String>>,
    save_password: bool,
}

impl Credentials {
    /// Creates new credentials with automatic memory zeroing.
    pub fn new(username: String, password: Option<String>) -> Self {
        Self {
            username: Zeroizing::new(username),
            password: Zeroizing::new(password),
            save_password: false,
        }
    }

    /// Marks the credentials as ones the user asked to persist.
    pub fn with_save_password(mut self, save_password: bool) -> Self {
        self.save_password = save_password;
        self
    }

    /// Gets the username (still protected by Zeroizing).
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Gets the password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Checks if password is present without exposing it.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Whether the prompt asked for the password to be saved.
    pub fn save_password(&self) -> bool {
        self.save_password
    }

    /// Copies the credentials into plain optional strings for a
    /// configuration that is about to be used for connecting.
    ///
    /// An empty user name maps to `None`.
    pub fn to_config_values(&self) -> (Option<String>, Option<String>) {
        let user = if self.username.is_empty() {
            None
        } else {
            Some(self.username.to_string())
        };
        (user, (*self.password).clone())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"****")
            .field("has_password", &self.has_password())
            .field("save_password", &self.save_password)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_answer_into_connection_values() {
        let creds = Credentials::new("scott".to_string(), Some("tiger".to_string()))
            .with_save_password(true);
        assert!(creds.save_password());
        assert_eq!(
            creds.to_config_values(),
            (Some("scott".to_string()), Some("tiger".to_string()))
        );
    }

    #[test]
    fn test_anonymous_login_has_no_values() {
        let creds = Credentials::new(String::new(), None);
        assert!(!creds.has_password());
        assert!(!creds.save_password());
        assert_eq!(creds.to_config_values(), (None, None));
    }

    #[test]
    fn test_user_without_password() {
        let creds = Credentials::new("readonly".to_string(), None);
        assert_eq!(creds.username(), "readonly");
        assert_eq!(creds.password(), None);
        assert_eq!(creds.to_config_values().0.as_deref(), Some("readonly"));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("admin".to_string(), Some("hunter2".to_string()));
        let debug = format!("{creds:?}");
        assert!(!debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("has_password: true"));
    }
}

//! Security utilities for credential protection and encryption.
//!
//! # Security Guarantees
//! - Credentials are stored in `Zeroizing` containers for automatic memory clearing
//! - Connection URLs are split so the password never reaches the configuration
//! - Secret vaults and encrypted projects use AES-GCM with Argon2id keys
//!
//! # Module Structure
//! - `credentials`: Secure credential container with automatic memory zeroing
//! - `connection`: Connection URL parsing
//! - `encryption`: AES-GCM encryption with Argon2id key derivation
//! - `legacy`: Obfuscated password decoding for legacy XML files

mod connection;
mod credentials;
pub mod encryption;
pub mod legacy;

pub use connection::{ParsedConnectionUrl, parse_connection_url};
pub use credentials::Credentials;

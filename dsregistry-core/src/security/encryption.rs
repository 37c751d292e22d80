//! AES-GCM encryption with Argon2id key derivation.
//!
//! Two consumers share this module:
//! - the project value encryptor, which seals the credentials file (and the
//!   whole configuration file for encrypted projects) with a raw 256-bit key;
//! - the secret vault, which seals its contents with a key derived from a
//!   master password and keeps the KDF parameters next to the ciphertext.
//!
//! # Security Guarantees
//! - AES-GCM-256 authenticated encryption with a fresh random nonce per seal
//! - Argon2id key derivation (RFC 9106) with a 16-byte random salt
//! - Key material lives in `Zeroizing` buffers

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, rand_core::RngCore},
};
use argon2::{
    Argon2, Params, Version,
    password_hash::{PasswordHasher, SaltString},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::RegistryError;

/// Algorithm identifier stored in sealed envelopes.
pub const ALGORITHM: &str = "AES-GCM-256";

/// AES-GCM nonce size: 96 bits (NIST SP 800-38D §8.2.1)
const AES_GCM_NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size: 128 bits
const AES_GCM_TAG_SIZE: usize = 16;

/// AES key size: 256 bits
const AES_KEY_SIZE: usize = 32;

/// Argon2id salt size: 128 bits (RFC 9106 §4)
const ARGON2_SALT_SIZE: usize = 16;

/// Argon2id memory cost in KiB (64 MiB)
const ARGON2_MEMORY_COST: u32 = 65536;

/// Argon2id iterations
const ARGON2_TIME_COST: u32 = 3;

/// Argon2id lanes
const ARGON2_PARALLELISM: u32 = 4;

/// Key derivation parameters for Argon2id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Random salt (16 bytes)
    pub salt: Vec<u8>,
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Time cost (iterations)
    pub time_cost: u32,
    /// Parallelism factor
    pub parallelism: u32,
    /// Argon2 version (always 1.3)
    pub version: String,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new()
    }
}

impl KdfParams {
    /// Creates new KDF parameters with a random 16-byte salt.
    pub fn new() -> Self {
        let mut salt = vec![0u8; ARGON2_SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        Self {
            salt,
            memory_cost: ARGON2_MEMORY_COST,
            time_cost: ARGON2_TIME_COST,
            parallelism: ARGON2_PARALLELISM,
            version: "1.3".to_string(),
        }
    }

    /// Validates that KDF parameters meet security requirements.
    ///
    /// # Errors
    /// Returns error if parameters don't meet minimum security thresholds
    pub fn validate(&self) -> crate::Result<()> {
        if self.salt.len() < ARGON2_SALT_SIZE {
            return Err(RegistryError::encryption(format!(
                "Salt must be at least {} bytes",
                ARGON2_SALT_SIZE
            )));
        }
        if self.memory_cost < ARGON2_MEMORY_COST {
            return Err(RegistryError::encryption(format!(
                "Memory cost must be at least {} KiB (64 MiB)",
                ARGON2_MEMORY_COST
            )));
        }
        if self.time_cost < ARGON2_TIME_COST {
            return Err(RegistryError::encryption(format!(
                "Time cost must be at least {} iterations",
                ARGON2_TIME_COST
            )));
        }
        if self.parallelism < 1 {
            return Err(RegistryError::encryption("Parallelism must be at least 1"));
        }
        Ok(())
    }
}

/// Sealed payload with everything needed to open it again given the
/// password its key was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Encryption algorithm (always "AES-GCM-256")
    pub algorithm: String,
    /// Random 96-bit (12-byte) nonce
    pub nonce: Vec<u8>,
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// Authentication tag (16 bytes)
    pub auth_tag: Vec<u8>,
    /// Key derivation parameters
    pub kdf_params: KdfParams,
}

impl EncryptedData {
    fn validate(&self) -> crate::Result<()> {
        if self.algorithm != ALGORITHM {
            return Err(RegistryError::encryption(format!(
                "Unsupported encryption algorithm: {}",
                self.algorithm
            )));
        }
        if self.nonce.len() != AES_GCM_NONCE_SIZE {
            return Err(RegistryError::encryption(format!(
                "Invalid nonce length: expected {}, got {}",
                AES_GCM_NONCE_SIZE,
                self.nonce.len()
            )));
        }
        if self.auth_tag.len() != AES_GCM_TAG_SIZE {
            return Err(RegistryError::encryption(format!(
                "Invalid authentication tag length: expected {}, got {}",
                AES_GCM_TAG_SIZE,
                self.auth_tag.len()
            )));
        }
        self.kdf_params.validate()
    }
}

/// Derives an AES-256 key from a password using Argon2id.
///
/// # Errors
/// Returns error if the parameters are invalid or derivation fails
pub fn derive_key(password: &str, kdf_params: &KdfParams) -> crate::Result<Zeroizing<[u8; 32]>> {
    kdf_params.validate()?;

    let params = Params::new(
        kdf_params.memory_cost,
        kdf_params.time_cost,
        kdf_params.parallelism,
        Some(AES_KEY_SIZE),
    )
    .map_err(|e| RegistryError::encryption(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let salt_string = SaltString::encode_b64(&kdf_params.salt)
        .map_err(|e| RegistryError::encryption(format!("Invalid salt: {}", e)))?;

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt_string)
        .map_err(|e| RegistryError::encryption(format!("Key derivation failed: {}", e)))?;

    let hash_bytes = password_hash
        .hash
        .ok_or_else(|| RegistryError::encryption("Key derivation produced no output"))?;

    if hash_bytes.as_bytes().len() != AES_KEY_SIZE {
        return Err(RegistryError::encryption(format!(
            "Key derivation produced incorrect key length: expected {}, got {}",
            AES_KEY_SIZE,
            hash_bytes.as_bytes().len()
        )));
    }

    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    key.copy_from_slice(hash_bytes.as_bytes());
    Ok(key)
}

/// Symmetric encryptor holding a single project key.
///
/// Raw sealed values are laid out as `nonce || ciphertext || tag`.
///
/// # Example
/// ```rust
/// use dsregistry_core::security::encryption::ValueEncryptor;
///
/// let encryptor = ValueEncryptor::generate();
/// let sealed = encryptor.encrypt(b"{\"pg-1\":{}}")?;
/// assert_eq!(encryptor.decrypt(&sealed)?, b"{\"pg-1\":{}}");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ValueEncryptor {
    key: Zeroizing<[u8; AES_KEY_SIZE]>,
}

impl std::fmt::Debug for ValueEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueEncryptor(****)")
    }
}

impl ValueEncryptor {
    /// Wraps an existing 256-bit key.
    pub fn new(key: Zeroizing<[u8; 32]>) -> Self {
        Self { key }
    }

    /// Creates an encryptor with a fresh random key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        Self { key }
    }

    /// Derives the key from a password.
    ///
    /// # Errors
    /// Returns error if key derivation fails
    pub fn from_password(password: &str, kdf_params: &KdfParams) -> crate::Result<Self> {
        Ok(Self {
            key: derive_key(password, kdf_params)?,
        })
    }

    /// Decodes a base64 key as produced by [`ValueEncryptor::export_key`].
    ///
    /// # Errors
    /// Returns error if the text is not base64 or not 32 bytes long
    pub fn from_base64(encoded: &str) -> crate::Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| RegistryError::encryption(format!("Invalid key encoding: {}", e)))?,
        );
        if bytes.len() != AES_KEY_SIZE {
            return Err(RegistryError::encryption(format!(
                "Invalid key length: expected {}, got {}",
                AES_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Encodes the key as base64 for storage in a key file.
    pub fn export_key(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(&self.key[..]))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key[..]))
    }

    /// Seals raw bytes.
    ///
    /// # Errors
    /// Returns error if the cipher fails
    pub fn encrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, data)
            .map_err(|e| RegistryError::encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Opens bytes sealed by [`ValueEncryptor::encrypt`].
    ///
    /// # Errors
    /// Returns error if the input is truncated, was tampered with, or was
    /// sealed with a different key
    pub fn decrypt(&self, sealed: &[u8]) -> crate::Result<Vec<u8>> {
        if sealed.len() < AES_GCM_NONCE_SIZE + AES_GCM_TAG_SIZE {
            return Err(RegistryError::encryption(format!(
                "Encrypted value too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(AES_GCM_NONCE_SIZE);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| {
                RegistryError::encryption(format!(
                    "Decryption failed (wrong key or corrupted data): {}",
                    e
                ))
            })
    }

    /// Seals bytes into a self-describing envelope carrying `kdf_params`.
    ///
    /// The caller is responsible for `kdf_params` being the parameters this
    /// encryptor's key was derived with.
    ///
    /// # Errors
    /// Returns error if the cipher fails
    pub fn seal(&self, data: &[u8], kdf_params: &KdfParams) -> crate::Result<EncryptedData> {
        let sealed = self.encrypt(data)?;
        let (nonce, rest) = sealed.split_at(AES_GCM_NONCE_SIZE);
        let tag_offset = rest.len().saturating_sub(AES_GCM_TAG_SIZE);
        let (payload, auth_tag) = rest.split_at(tag_offset);

        Ok(EncryptedData {
            algorithm: ALGORITHM.to_string(),
            nonce: nonce.to_vec(),
            ciphertext: payload.to_vec(),
            auth_tag: auth_tag.to_vec(),
            kdf_params: kdf_params.clone(),
        })
    }

    /// Opens an envelope produced by [`ValueEncryptor::seal`].
    ///
    /// # Errors
    /// Returns error if the envelope is malformed or authentication fails
    pub fn open(&self, encrypted: &EncryptedData) -> crate::Result<Vec<u8>> {
        encrypted.validate()?;
        let mut sealed = Vec::with_capacity(
            encrypted.nonce.len() + encrypted.ciphertext.len() + encrypted.auth_tag.len(),
        );
        sealed.extend_from_slice(&encrypted.nonce);
        sealed.extend_from_slice(&encrypted.ciphertext);
        sealed.extend_from_slice(&encrypted.auth_tag);
        self.decrypt(&sealed)
    }
}

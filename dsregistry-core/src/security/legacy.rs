//! Password obfuscation used by legacy XML configuration files.
//!
//! This is not encryption: the value is XOR-ed with a fixed key and
//! base64-encoded. It is only read so old projects can be migrated.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const OBFUSCATION_KEY: &[u8] = b"sdf@!#$verf^wv%6Fwe%$$#FFGwfsdefwfe135s$^H)dg";

fn xor_with_key(data: &mut [u8]) {
    for (byte, key) in data.iter_mut().zip(OBFUSCATION_KEY.iter().cycle()) {
        *byte ^= key;
    }
}

/// Decodes an obfuscated legacy password. Anything that does not decode
/// to UTF-8 text yields `None`.
pub fn decode_legacy_password(encoded: &str) -> Option<String> {
    if encoded.is_empty() {
        return None;
    }
    let mut bytes = STANDARD.decode(encoded.trim()).ok()?;
    xor_with_key(&mut bytes);
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    bytes.truncate(end);
    String::from_utf8(bytes).ok()
}

/// Obfuscates a password the way legacy files stored it.
#[cfg(test)]
pub(crate) fn encode_legacy_password(password: &str) -> String {
    let mut bytes = password.as_bytes().to_vec();
    bytes.extend_from_slice(&[0, 0]);
    xor_with_key(&mut bytes);
    STANDARD.encode(bytes)
}

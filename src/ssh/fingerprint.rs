//! Host key fingerprints
//!
//! OpenSSH-compatible `SHA256:<base64, unpadded>` rendering of a raw key blob.

use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64_NO_PAD, Engine};
use sha2::{Digest, Sha256};

use super::error::TrustError;

/// Prefix shared by every fingerprint this module produces
pub const FINGERPRINT_PREFIX: &str = "SHA256:";

/// Compute the SHA256 fingerprint of raw public key bytes
pub fn fingerprint(key_material: &[u8]) -> Result<String, TrustError> {
    if key_material.is_empty() {
        return Err(TrustError::InvalidKey("empty key material".to_string()));
    }

    let hash = Sha256::digest(key_material);
    Ok(format!("{}{}", FINGERPRINT_PREFIX, BASE64_NO_PAD.encode(hash)))
}

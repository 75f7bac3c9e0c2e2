use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::OmicError;

/// Length of the nonce prepended to every encrypted archive.
const NONCE_LEN: usize = 12;

/// SHA-256 hex digest of a byte buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Derive a 256-bit AES key from the shared archive password.
fn derive_key(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Decrypt an archive laid out as `nonce (12 bytes) || ciphertext`.
///
/// A wrong password or corrupted ciphertext fails AEAD authentication and
/// is reported as a decryption failure, never as garbage plaintext.
pub fn decrypt_archive(name: &str, password: &str, bytes: &[u8]) -> Result<Vec<u8>, OmicError> {
    if bytes.len() < NONCE_LEN {
        return Err(OmicError::Decryption {
            name: name.to_string(),
            reason: format!("archive too short ({} bytes)", bytes.len()),
        });
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let key = derive_key(password);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OmicError::Decryption {
            name: name.to_string(),
            reason: "authentication failed (wrong password or corrupted bytes)".to_string(),
        })
}

/// Encrypt plaintext into the archive layout understood by
/// [`decrypt_archive`]. Used when preparing hosted archives and by tests.
pub fn encrypt_archive(
    password: &str,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, OmicError> {
    let key = derive_key(password);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|err| OmicError::Filesystem(format!("encryption failed: {err}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn roundtrip() {
        let sealed = encrypt_archive("uef-czi", &[7u8; 12], b"count matrix").unwrap();
        let plain = decrypt_archive("pbmc.zip", "uef-czi", &sealed).unwrap();
        assert_eq!(plain, b"count matrix");
    }

    #[test]
    fn wrong_password_rejected() {
        let sealed = encrypt_archive("uef-czi", &[7u8; 12], b"count matrix").unwrap();
        let err = decrypt_archive("pbmc.zip", "wrong", &sealed).unwrap_err();
        assert_matches!(err, OmicError::Decryption { .. });
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let mut sealed = encrypt_archive("uef-czi", &[7u8; 12], b"count matrix").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        let err = decrypt_archive("pbmc.zip", "uef-czi", &sealed).unwrap_err();
        assert_matches!(err, OmicError::Decryption { .. });
    }

    #[test]
    fn short_input_rejected() {
        let err = decrypt_archive("pbmc.zip", "uef-czi", &[1, 2, 3]).unwrap_err();
        assert_matches!(err, OmicError::Decryption { .. });
    }

    #[test]
    fn sha256_hex_stable() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

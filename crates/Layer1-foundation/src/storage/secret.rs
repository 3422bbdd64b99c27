//! Sealing of sensitive settings at rest
//!
//! Values are encrypted with XChaCha20-Poly1305 under a per-installation key
//! kept next to the database. Sealed values are stored as
//! `burrow:v1:<base64(nonce || ciphertext)>`.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Key file name inside the data directory
pub const SECRET_KEY_FILE: &str = "secret.key";

const SEALED_PREFIX: &str = "burrow:v1:";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Symmetric cipher for settings such as the API token secret
pub struct SecretBox {
    cipher: XChaCha20Poly1305,
}

impl SecretBox {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Fresh random key, never persisted
    pub fn ephemeral() -> Self {
        Self::from_key(&random_key())
    }

    /// Read the key at `path`, creating it (mode 0600 on unix) when absent
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
                Error::Config(format!("Invalid key file {}: {}", path.display(), e))
            })?;
            let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
                Error::Config(format!("Key file {} must hold 32 bytes", path.display()))
            })?;
            return Ok(Self::from_key(&key));
        }

        let key = random_key();
        write_private(path, STANDARD.encode(key).as_bytes())?;
        info!(path = %path.display(), "Created settings encryption key");
        Ok(Self::from_key(&key))
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Internal("Failed to encrypt setting".to_string()))?;

        let mut data = nonce.to_vec();
        data.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(data)))
    }

    /// Decrypt a sealed value; unsealed values pass through unchanged
    pub fn open(&self, value: &str) -> Result<String> {
        let Some(encoded) = value.strip_prefix(SEALED_PREFIX) else {
            return Ok(value.to_string());
        };
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Storage(format!("Corrupt sealed setting: {}", e)))?;
        if data.len() < NONCE_LEN {
            return Err(Error::Storage("Corrupt sealed setting: too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                Error::Storage(
                    "Sealed setting does not match the key file; set it again".to_string(),
                )
            })?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Storage(format!("Sealed setting is not UTF-8: {}", e)))
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let secrets = SecretBox::ephemeral();
        let sealed = secrets.seal("a1b2-c3d4").unwrap();
        assert!(SecretBox::is_sealed(&sealed));
        assert!(!sealed.contains("a1b2-c3d4"));
        assert_eq!(secrets.open(&sealed).unwrap(), "a1b2-c3d4");
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let secrets = SecretBox::ephemeral();
        assert_ne!(secrets.seal("x").unwrap(), secrets.seal("x").unwrap());
    }

    #[test]
    fn test_plain_value_passes_through() {
        let secrets = SecretBox::ephemeral();
        assert_eq!(secrets.open("legacy-plaintext").unwrap(), "legacy-plaintext");
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = SecretBox::ephemeral().seal("secret").unwrap();
        let err = SecretBox::ephemeral().open(&sealed).unwrap_err();
        assert!(err.to_string().contains("set it again"));
    }

    #[test]
    fn test_key_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SECRET_KEY_FILE);
        let sealed = SecretBox::load_or_create(&path).unwrap().seal("secret").unwrap();
        let reopened = SecretBox::load_or_create(&path).unwrap();
        assert_eq!(reopened.open(&sealed).unwrap(), "secret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_short_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SECRET_KEY_FILE);
        std::fs::write(&path, STANDARD.encode([1u8; 8])).unwrap();
        assert!(SecretBox::load_or_create(&path).is_err());
    }
}

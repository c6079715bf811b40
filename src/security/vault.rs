// Credential vault: encrypted storage for per-tenant channel secrets.
//
// Channel credentials (mailbox passwords, bot tokens, business-API access
// tokens) are encrypted with ChaCha20-Poly1305 AEAD under a random key kept
// in `<config dir>/.vault_key` with owner-only permissions (0600). The
// channel registry persists only hex-encoded ciphertext, never plaintext.
//
// Each encryption generates a fresh random 12-byte nonce, prepended to the
// ciphertext, so a stored value is self-contained. The Poly1305 tag rejects
// tampered values.
//
// A failed decrypt means the stored credential is unusable (corrupt value or
// rotated key). Callers surface that as "reconnect the channel", never as a
// fatal process error.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Length of the random encryption key in bytes (256-bit, matches `ChaCha20`).
const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Storage prefix for sealed values.
const SEALED_PREFIX: &str = "enc1:";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key unavailable: {0}")]
    Key(String),
    #[error("stored credential is malformed or was sealed with a different key")]
    Unreadable,
}

/// Encrypts and decrypts tenant channel secrets.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    /// Path to the key file (`<config dir>/.vault_key`).
    key_path: PathBuf,
    /// Whether encryption is enabled. When disabled, values pass through
    /// unchanged (plaintext deployments, e.g. throwaway dev setups).
    enabled: bool,
}

impl CredentialVault {
    pub fn new(config_dir: &Path, enabled: bool) -> Self {
        Self {
            key_path: config_dir.join(".vault_key"),
            enabled,
        }
    }

    /// Encrypt a plaintext secret. Returns `enc1:<hex(nonce ‖ ciphertext ‖ tag)>`.
    /// If encryption is disabled, returns the plaintext as-is.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if !self.enabled || plaintext.is_empty() {
            return Ok(plaintext.to_string());
        }

        let key_bytes = self.load_or_create_key()?;
        let key = Key::from_slice(&key_bytes);
        let cipher = ChaCha20Poly1305::new(key);

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Unreadable)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", hex::encode(&blob)))
    }

    /// Decrypt a stored value.
    /// - `enc1:` prefix → ChaCha20-Poly1305
    /// - no prefix → returned as-is (vault disabled when the value was stored)
    pub fn decrypt(&self, value: &str) -> Result<String, VaultError> {
        let Some(hex_str) = value.strip_prefix(SEALED_PREFIX) else {
            return Ok(value.to_string());
        };

        let blob = hex::decode(hex_str).map_err(|_| VaultError::Unreadable)?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Unreadable);
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key_bytes = self.load_or_create_key()?;
        let key = Key::from_slice(&key_bytes);
        let cipher = ChaCha20Poly1305::new(key);

        let plaintext_bytes = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Unreadable)?;

        String::from_utf8(plaintext_bytes).map_err(|_| VaultError::Unreadable)
    }

    /// Check whether a value carries the sealed prefix.
    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    /// Load the encryption key from disk, or create one if it doesn't exist.
    fn load_or_create_key(&self) -> Result<Vec<u8>, VaultError> {
        if self.key_path.exists() {
            let hex_key = fs::read_to_string(&self.key_path)
                .map_err(|e| VaultError::Key(format!("read {}: {e}", self.key_path.display())))?;
            return hex::decode(hex_key.trim())
                .ok()
                .filter(|k| k.len() == KEY_LEN)
                .ok_or_else(|| VaultError::Key("key file is corrupt".into()));
        }

        let key = ChaCha20Poly1305::generate_key(&mut OsRng).to_vec();
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VaultError::Key(format!("create {}: {e}", parent.display())))?;
        }

        let key_hex = hex::encode(&key);
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.key_path)
        {
            Ok(mut key_file) => {
                // Restrict permissions before any key bytes land on disk.
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    key_file
                        .set_permissions(fs::Permissions::from_mode(0o600))
                        .map_err(|e| VaultError::Key(format!("chmod key file: {e}")))?;
                }

                key_file
                    .write_all(key_hex.as_bytes())
                    .map_err(|e| VaultError::Key(format!("write key file: {e}")))?;
                key_file
                    .sync_all()
                    .map_err(|e| VaultError::Key(format!("fsync key file: {e}")))?;
                Ok(key)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // Concurrent creator won the race; read the existing key.
                let hex_key = fs::read_to_string(&self.key_path)
                    .map_err(|e| VaultError::Key(format!("read raced key file: {e}")))?;
                hex::decode(hex_key.trim())
                    .ok()
                    .filter(|k| k.len() == KEY_LEN)
                    .ok_or_else(|| VaultError::Key("raced key file is corrupt".into()))
            }
            Err(err) => Err(VaultError::Key(format!("create key file: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn seal_unseal_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        let secret = "imap-password-Sup3rS3cret";

        let sealed = vault.encrypt(secret).unwrap();
        assert!(sealed.starts_with("enc1:"));
        assert_ne!(sealed, secret);

        assert_eq!(vault.decrypt(&sealed).unwrap(), secret);
    }

    #[test]
    fn empty_secret_passes_through() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        assert_eq!(vault.encrypt("").unwrap(), "");
    }

    #[test]
    fn unsealed_value_passes_through() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        assert_eq!(vault.decrypt("raw-bot-token").unwrap(), "raw-bot-token");
    }

    #[test]
    fn disabled_vault_stores_plaintext() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), false);
        assert_eq!(vault.encrypt("bot-token").unwrap(), "bot-token");
    }

    #[test]
    fn is_sealed_detects_prefix() {
        assert!(CredentialVault::is_sealed("enc1:aabbcc"));
        assert!(!CredentialVault::is_sealed("aabbcc"));
        assert!(!CredentialVault::is_sealed(""));
    }

    #[test]
    fn key_file_created_on_first_encrypt() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        assert!(!vault.key_path.exists());

        vault.encrypt("probe").unwrap();
        assert!(vault.key_path.exists());

        let key_hex = fs::read_to_string(&vault.key_path).unwrap();
        assert_eq!(key_hex.len(), KEY_LEN * 2);
    }

    #[test]
    fn same_plaintext_seals_differently() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);

        let a = vault.encrypt("token").unwrap();
        let b = vault.encrypt("token").unwrap();
        assert_ne!(a, b, "fresh nonce per encryption");

        assert_eq!(vault.decrypt(&a).unwrap(), "token");
        assert_eq!(vault.decrypt(&b).unwrap(), "token");
    }

    #[test]
    fn separate_instances_share_the_key_file() {
        let tmp = TempDir::new().unwrap();
        let a = CredentialVault::new(tmp.path(), true);
        let b = CredentialVault::new(tmp.path(), true);

        let sealed = a.encrypt("shared").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), "shared");
    }

    #[test]
    fn unicode_secret_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        let secret = "пароль-密码-🔑";

        let sealed = vault.encrypt(secret).unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), secret);
    }

    #[test]
    fn malformed_hex_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        assert!(matches!(
            vault.decrypt("enc1:not-hex!!"),
            Err(VaultError::Unreadable)
        ));
    }

    #[test]
    fn truncated_blob_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        // Shorter than the nonce.
        assert!(matches!(
            vault.decrypt("enc1:aabbccdd"),
            Err(VaultError::Unreadable)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        let sealed = vault.encrypt("whatsapp-access-token").unwrap();

        let mut blob = hex::decode(&sealed[5..]).unwrap();
        blob[NONCE_LEN] ^= 0xff;
        let tampered = format!("enc1:{}", hex::encode(&blob));

        assert!(matches!(
            vault.decrypt(&tampered),
            Err(VaultError::Unreadable)
        ));
    }

    #[test]
    fn rotated_key_is_unreadable_not_fatal() {
        let tmp1 = TempDir::new().unwrap();
        let tmp2 = TempDir::new().unwrap();
        let old = CredentialVault::new(tmp1.path(), true);
        let new = CredentialVault::new(tmp2.path(), true);

        let sealed = old.encrypt("credential").unwrap();
        assert!(matches!(new.decrypt(&sealed), Err(VaultError::Unreadable)));
    }

    #[test]
    fn wrong_length_key_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        // Valid hex, but 4 bytes instead of 32.
        fs::write(&vault.key_path, "aabbccdd").unwrap();
        assert!(matches!(vault.encrypt("secret"), Err(VaultError::Key(_))));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let vault = CredentialVault::new(tmp.path(), true);
        vault.encrypt("trigger key creation").unwrap();

        let perms = fs::metadata(&vault.key_path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}

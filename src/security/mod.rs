//! Security subsystem for credential sealing and session authentication.
//!
//! [`CredentialVault`] encrypts channel credentials at rest so that mailbox
//! passwords, bot tokens, and platform access tokens never sit in plaintext
//! in the conversation store or on disk. [`SessionSigner`] mints and verifies
//! the tenant-scoped session tokens that the ownership guard checks on every
//! tenant route.
//!
//! Free functions here are the small shared primitives: constant-time string
//! comparison for webhook handshakes and admin keys, bind-address
//! classification, and log redaction.

pub mod session;
pub mod vault;

pub use session::{SessionSigner, generate_admin_key, generate_signing_key};
pub use vault::{CredentialVault, VaultError};

/// Compare two strings in constant time.
///
/// Examines `max(a.len(), b.len())` bytes regardless of where the inputs
/// first differ, so unequal secrets cost the same as equal ones.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let longest = a.len().max(b.len());

    // Fold the length mismatch and every byte mismatch into one accumulator,
    // reading past the shorter input as zeros.
    let mut diff = a.len() ^ b.len();
    for i in 0..longest {
        let x = usize::from(*a.get(i).unwrap_or(&0));
        let y = usize::from(*b.get(i).unwrap_or(&0));
        diff |= x ^ y;
    }
    diff == 0
}

/// Check if a host string represents a non-localhost bind address.
pub fn is_public_bind(host: &str) -> bool {
    !matches!(
        host,
        "127.0.0.1" | "localhost" | "::1" | "[::1]" | "0:0:0:0:0:0:0:1"
    )
}

/// Redact a sensitive value for logging: at most four leading characters
/// followed by `***`. Safe on multi-byte input.
pub fn redact(value: &str) -> String {
    if value.len() <= 4 {
        return "***".to_string();
    }
    let cut = crate::util::floor_utf8_char_boundary(value, 4);
    format!("{}***", &value[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_vault_encrypt_decrypt_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let vault = CredentialVault::new(temp.path(), true);

        let encrypted = vault.encrypt("imap-password").unwrap();
        let decrypted = vault.decrypt(&encrypted).unwrap();

        assert_eq!(decrypted, "imap-password");
    }

    #[test]
    fn reexported_signer_issues_verifiable_tokens() {
        let signer = SessionSigner::new("unit-test-key", 600).unwrap();
        let token = signer.issue("tenant-9").unwrap();
        assert_eq!(signer.verify(&token).unwrap(), "tenant-9");
    }

    #[test]
    fn constant_time_eq_matches_exact_strings() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc", "abc123"));
        assert!(!constant_time_eq("abc123", ""));
    }

    #[test]
    fn public_bind_detection() {
        assert!(!is_public_bind("127.0.0.1"));
        assert!(!is_public_bind("localhost"));
        assert!(!is_public_bind("::1"));
        assert!(is_public_bind("0.0.0.0"));
        assert!(is_public_bind("192.168.1.5"));
    }

    #[test]
    fn redact_hides_most_of_value() {
        assert_eq!(redact("abcdefgh"), "abcd***");
        assert_eq!(redact("ab"), "***");
        assert_eq!(redact(""), "***");
        assert_eq!(redact("12345"), "1234***");
        assert_eq!(redact("🦀🦀🦀"), "🦀***");
    }
}

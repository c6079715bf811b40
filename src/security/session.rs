//! Session tokens that bind an API caller to a single tenant.
//!
//! A session token is an HS256 JWT whose `sub` claim names the tenant the
//! holder may act for. Tokens are minted by the `token` CLI command and by
//! `POST /api/session` (guarded by the deployment admin key), then presented
//! as `Authorization: Bearer <token>` on tenant-scoped routes. The ownership
//! guard verifies the signature and expiry before any handler runs.

use anyhow::{Context, Result};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Claims carried by a session token. `sub` is the tenant id.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and verifies tenant session tokens with a shared HS256 key.
///
/// The key never leaves the deployment: tokens prove knowledge of it without
/// exposing it, so a leaked token compromises one tenant for one TTL window,
/// not the signing key itself.
pub struct SessionSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl SessionSigner {
    /// Build a signer from the deployment signing key and a token lifetime
    /// in seconds. An empty key is a configuration error, not a fallback to
    /// unsigned tokens.
    pub fn new(signing_key: &str, ttl_secs: i64) -> Result<Self> {
        anyhow::ensure!(
            !signing_key.trim().is_empty(),
            "session signing key is empty (set [sessions] signing_key in config)"
        );
        Ok(Self {
            encoding: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding: DecodingKey::from_secret(signing_key.as_bytes()),
            ttl_secs,
        })
    }

    /// Issue a token scoped to `tenant_id`, valid for the configured TTL.
    pub fn issue(&self, tenant_id: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = SessionClaims {
            sub: tenant_id.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding).context("failed to sign session token")
    }

    /// Verify a token and return the tenant id it is scoped to.
    ///
    /// Expired, tampered, and foreign-key tokens all fail here; callers map
    /// the failure to a denial without touching tenant state.
    pub fn verify(&self, token: &str) -> Result<String> {
        let data = decode::<SessionClaims>(token, &self.decoding, &Validation::default())
            .context("session token rejected")?;
        Ok(data.claims.sub)
    }
}

/// Generate a fresh HS256 signing key: 32 random bytes, hex-encoded.
///
/// Uses `rand::rng()` which is backed by the OS CSPRNG (/dev/urandom on
/// Linux, BCryptGenRandom on Windows, SecRandomCopyBytes on macOS).
pub fn generate_signing_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a deployment admin key with 256-bit entropy. The `tl_` prefix
/// makes leaked keys greppable in logs and dotfiles.
pub fn generate_admin_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("tl_{}", hex::encode(bytes))
}

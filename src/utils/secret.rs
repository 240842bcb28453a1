use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Bcrypt cost factor for hashing secrets (client secrets, app passwords).
pub const BCRYPT_COST: u32 = 12;

/// Hash a secret using bcrypt
///
/// # Arguments
/// * `secret` - The plain text secret to hash
///
/// # Returns
/// * `Ok(String)` - The bcrypt hash of the secret
/// * `Err(CoreError)` - If hashing fails
pub fn hash_secret(secret: &str) -> Result<String, CoreError> {
    bcrypt::hash(secret, BCRYPT_COST)
        .map_err(|e| CoreError::Signing(format!("secret hashing failed: {e}")))
}

/// Verify a secret against a stored bcrypt hash. bcrypt's own comparison is
/// already constant-time over the digest.
///
/// # Arguments
/// * `secret` - The plain text secret to verify
/// * `hash` - The stored bcrypt hash
///
/// # Returns
/// * `Ok(true)` - If the secret matches
/// * `Ok(false)` - If the secret does not match
/// * `Err(CoreError)` - If verification fails
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, CoreError> {
    bcrypt::verify(secret, hash)
        .map_err(|e| CoreError::Signing(format!("secret verification failed: {e}")))
}

// ============================================================================
// OAuth Token Hashing Utilities
// ============================================================================
// Opaque tokens (access_token, refresh_token, authorization code) are hashed
// with SHA256 rather than bcrypt before storage: they're already high-entropy
// random values, so a fast deterministic digest is enough for lookup and no
// salt is needed.
// ============================================================================

/// Character set for OAuth token generation (URL-safe base64 characters)
const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Default length for generated OAuth tokens (256 bits of entropy)
pub const DEFAULT_TOKEN_LENGTH: usize = 43;

/// Generate a cryptographically secure random OAuth token
///
/// # Returns
/// A random URL-safe string suitable for use as an OAuth token
pub fn generate_oauth_token() -> String {
    generate_oauth_token_with_length(DEFAULT_TOKEN_LENGTH)
}

/// Generate a cryptographically secure random OAuth token with specified length
/// 
/// # Arguments
/// * `length` - The desired length of the token
/// 
/// # Returns
/// A random URL-safe string of the specified length
pub fn generate_oauth_token_with_length(length: usize) -> String {
    let mut rng = rand::thread_rng();
    
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..TOKEN_CHARSET.len());
            TOKEN_CHARSET[idx] as char
        })
        .collect()
}

/// Hash an OAuth token using SHA256 for storage
/// 
/// Uses SHA256 instead of bcrypt because:
/// - Tokens are already high-entropy random values
/// - Faster lookup performance for token validation
/// - No salt needed since tokens are unique
/// 
/// # Arguments
/// * `token` - The plain text token to hash
/// 
/// # Returns
/// The base64url-encoded SHA256 hash of the token
pub fn hash_oauth_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let hash = hasher.finalize();
    URL_SAFE_NO_PAD.encode(hash)
}

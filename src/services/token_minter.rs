//! §4.5: mints the opaque access/refresh token pair, the `at_hash`-bound ID
//! token claims, and signs the latter with the provider's own key.

use chrono::{DateTime, Utc};

use crate::config::KeyCache;
use crate::error::CoreError;
use crate::models::{IdToken, Provider, RefreshToken};
use crate::utils::jwt::{compute_at_hash, encode_id_token, encoding_key_from_pem, parse_algorithm};
use crate::utils::secret::generate_oauth_token;

pub struct TokenMinter<'a> {
    pub key_cache: &'a KeyCache,
    pub issuer: &'a str,
    pub default_token_validity: &'a str,
    pub now: DateTime<Utc>,
}

impl<'a> TokenMinter<'a> {
    /// Generates a fresh opaque access/refresh token pair bound to `(user, scope)`.
    /// `at_hash` is precomputed per I5; `id_token` is left unset — the caller
    /// attaches one via `create_id_token` only on the branches that need it.
    pub fn mint(&self, provider: &Provider, user_uid: &str, scope: Vec<String>) -> RefreshToken {
        let access_token = generate_oauth_token();
        let refresh_token = generate_oauth_token();
        let at_hash = compute_at_hash(&access_token);
        let expires_at = self.now + provider.token_validity_duration(self.default_token_validity);

        RefreshToken {
            refresh_token,
            access_token,
            provider_id: provider.id.clone(),
            user_uid: user_uid.to_string(),
            scope,
            id_token: None,
            at_hash,
            expires_at,
            revoked: false,
        }
    }

    /// Builds the OIDC claim set for a freshly minted `token`. `nonce` is
    /// carried from the originating authorization code when applicable.
    pub fn create_id_token(&self, provider: &Provider, token: &RefreshToken, nonce: Option<String>) -> IdToken {
        IdToken {
            iss: self.issuer.to_string(),
            sub: token.user_uid.clone(),
            aud: provider.client_id.clone(),
            exp: token.expires_at.timestamp(),
            iat: self.now.timestamp(),
            nonce,
            at_hash: token.at_hash.clone(),
        }
    }

    /// Signs `claims` as a compact JWS using the provider's configured
    /// algorithm and key, caching the built `EncodingKey` per provider.
    pub fn encode(&self, provider: &Provider, claims: &IdToken) -> Result<String, CoreError> {
        let alg = parse_algorithm(&provider.signing_alg)
            .map_err(|e| CoreError::Signing(format!("unsupported signing algorithm: {e}")))?;

        let key = self
            .key_cache
            .get_or_insert_encoding(&provider.id, || encoding_key_from_pem(&provider.signing_key_pem, alg))
            .map_err(|e| CoreError::Signing(format!("failed to load signing key: {e}")))?;

        encode_id_token(claims, &key, alg)
    }
}

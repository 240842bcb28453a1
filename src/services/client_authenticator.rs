//! RFC 6749 §2.3 client authentication: extracts `(client_id, client_secret)`
//! or an RFC 7523 `client_assertion` from the request, then (for confidential
//! clients on the two grants that require it) verifies the secret.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::dto::token::TokenRequestForm;
use crate::error::TokenError;
use crate::models::{ClientType, Provider};
use crate::utils::secret::verify_secret;

/// Everything `GrantValidator`/`JwtAssertionVerifier` need to know about who
/// is calling, independent of how it arrived (Basic header vs form body).
#[derive(Debug, Clone, Default)]
pub struct ExtractedCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

pub struct ClientAuthenticator;

impl ClientAuthenticator {
    /// Order per spec: `Authorization: Basic` first, form fields second.
    /// The JWT-assertion branch may still carry no `client_id` here; the
    /// endpoint derives it from the verified assertion's `sub` once
    /// `JwtAssertionVerifier` has run.
    pub fn extract(
        authorization_header: Option<&str>,
        form: &TokenRequestForm,
    ) -> Result<ExtractedCredentials, TokenError> {
        if let Some(header) = authorization_header {
            if let Some(basic) = header.strip_prefix("Basic ") {
                return Self::decode_basic(basic.trim());
            }
        }

        Ok(ExtractedCredentials {
            client_id: form.client_id.clone(),
            client_secret: form.client_secret.clone(),
        })
    }

    fn decode_basic(encoded: &str) -> Result<ExtractedCredentials, TokenError> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| TokenError::invalid_client("malformed Authorization header"))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| TokenError::invalid_client("malformed Authorization header"))?;

        let (id, secret) = decoded
            .split_once(':')
            .ok_or_else(|| TokenError::invalid_client("malformed Authorization header"))?;

        let id = urlencoding::decode(id)
            .map_err(|_| TokenError::invalid_client("malformed Authorization header"))?
            .into_owned();
        let secret = urlencoding::decode(secret)
            .map_err(|_| TokenError::invalid_client("malformed Authorization header"))?
            .into_owned();

        Ok(ExtractedCredentials {
            client_id: Some(id),
            client_secret: Some(secret),
        })
    }

    /// Confidential clients must present a matching secret, but only on the
    /// two grants where RFC 6749 requires client authentication; the
    /// `client_credentials`/`password` branches authenticate some other way
    /// (username/password, JWT assertion) and never reach this check.
    /// Comparison is constant-time via `bcrypt`'s own digest comparison.
    pub fn verify_secret(
        provider: &Provider,
        grant_type: &str,
        client_secret: Option<&str>,
    ) -> Result<(), TokenError> {
        if provider.client_type != ClientType::Confidential {
            return Ok(());
        }
        if !matches!(grant_type, "authorization_code" | "refresh_token") {
            return Ok(());
        }

        let Some(hash) = provider.client_secret_hash.as_deref() else {
            return Err(TokenError::invalid_client("client has no registered secret"));
        };
        let secret = client_secret.unwrap_or("");
        let matches = verify_secret(secret, hash)
            .map_err(|_| TokenError::invalid_client("client secret verification failed"))?;

        if matches {
            Ok(())
        } else {
            Err(TokenError::invalid_client("client secret mismatch"))
        }
    }
}

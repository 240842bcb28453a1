use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// RFC 6749 §5.2 error body. `error` is one of the four codes the token
/// endpoint is allowed to emit; `error_description` is optional and never
/// carries internal detail.
#[derive(Serialize)]
pub struct TokenErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// The closed set of RFC 6749 error codes this endpoint returns. Every
/// validation failure in `GrantValidator`/`ClientAuthenticator`/
/// `JwtAssertionVerifier` maps to one of these; nothing else reaches the
/// client as a 400.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid client")]
    InvalidClient(Option<String>),

    #[error("invalid grant")]
    InvalidGrant(Option<String>),

    #[error("invalid scope")]
    InvalidScope(Option<String>),

    #[error("unsupported grant type")]
    UnsupportedGrantType,
}

impl TokenError {
    pub fn invalid_client(msg: impl Into<String>) -> Self {
        TokenError::InvalidClient(Some(msg.into()))
    }

    pub fn invalid_grant(msg: impl Into<String>) -> Self {
        TokenError::InvalidGrant(Some(msg.into()))
    }

    pub fn invalid_scope(msg: impl Into<String>) -> Self {
        TokenError::InvalidScope(Some(msg.into()))
    }
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let (code, description) = match self {
            TokenError::InvalidClient(desc) => ("invalid_client", desc),
            TokenError::InvalidGrant(desc) => ("invalid_grant", desc),
            TokenError::InvalidScope(desc) => ("invalid_scope", desc),
            TokenError::UnsupportedGrantType => ("unsupported_grant_type", None),
        };

        tracing::warn!(error = code, description = description.as_deref(), "token request rejected");

        let body = Json(TokenErrorBody {
            error: code,
            error_description: description,
        });

        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// Policy-gate denial. Distinct from `TokenError` because RFC 6749 gives it
/// no dedicated error code; surfaced as a bare 403.
#[derive(Debug, thiserror::Error)]
pub enum UserAuthError {
    #[error("access denied by policy")]
    PolicyDenied,
}

impl IntoResponse for UserAuthError {
    fn into_response(self) -> Response {
        tracing::warn!("policy gate denied request");
        StatusCode::FORBIDDEN.into_response()
    }
}

/// Store failures, signing failures, and other conditions that have no
/// RFC 6749 representation. Kept out of `TokenError` so the client-facing
/// error-code set stays closed; converts to a bare 500 with no body detail.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "internal token endpoint failure");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

/// Top-level error the handler layer converts to a response. `GrantValidator`,
/// `ClientAuthenticator`, `JwtAssertionVerifier` and `PolicyGate` each surface
/// into one of these variants via `?`.
#[derive(Debug, thiserror::Error)]
pub enum CoreFailure {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Auth(#[from] UserAuthError),
    #[error(transparent)]
    Internal(#[from] CoreError),
}

impl IntoResponse for CoreFailure {
    fn into_response(self) -> Response {
        match self {
            CoreFailure::Token(e) => e.into_response(),
            CoreFailure::Auth(e) => e.into_response(),
            CoreFailure::Internal(e) => e.into_response(),
        }
    }
}

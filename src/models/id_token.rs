use serde::{Deserialize, Serialize};

/// OIDC claim set synthesized per exchange and serialized with
/// `Provider.encode`. Owned by its `RefreshToken`; holds no back-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdToken {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub at_hash: String,
}

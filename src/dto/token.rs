use serde::{Deserialize, Serialize};

/// The token endpoint's form body (§6). Every field is optional at the wire
/// level; which ones are actually required is a function of `grant_type`
/// and is enforced by `GrantValidator`, not by this struct.
#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct TokenRequestForm {
    pub grant_type: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_assertion: Option<String>,
    #[serde(default)]
    pub client_assertion_type: Option<String>,
}

impl TokenRequestForm {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Success body (§6). `refresh_token`/`id_token` are omitted whenever the
/// grant didn't produce one, rather than serialized as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponseBody {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenResponseBody {
    pub fn new(access_token: String, expires_in: i64) -> Self {
        Self {
            access_token,
            refresh_token: None,
            token_type: "bearer",
            expires_in,
            id_token: None,
        }
    }

    pub fn with_refresh_token(mut self, token: String) -> Self {
        self.refresh_token = Some(token);
        self
    }

    pub fn with_id_token(mut self, jws: String) -> Self {
        self.id_token = Some(jws);
        self
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Confidential providers must present a `client_secret`; public providers
/// (native/SPA clients using PKCE) may omit it entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientType {
    Confidential,
    Public,
}

impl ClientType {
    pub fn from_db(value: &str) -> Self {
        match value {
            "PUBLIC" => ClientType::Public,
            _ => ClientType::Confidential,
        }
    }

    pub fn as_db(&self) -> &'static str {
        match self {
            ClientType::Confidential => "CONFIDENTIAL",
            ClientType::Public => "PUBLIC",
        }
    }
}

/// A static X.509 keypair registered on a provider for RFC 7523 client
/// assertion verification. `private_key_pem` is carried only so its public
/// half can be preferred when present; the core never signs with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationKey {
    pub name: String,
    pub certificate_pem: String,
    pub private_key_pem: Option<String>,
}

/// A JWKS document source, refreshed on a TTL by `JwksCache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksSource {
    pub name: String,
    pub url: String,
}

/// A registered OAuth client. `redirect_uris` is a newline-separated list of
/// regular expressions, matched in full against the request's `redirect_uri`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub client_id: String,
    pub client_secret_hash: Option<String>,
    pub client_type: ClientType,
    pub name: String,
    pub redirect_uris: String,
    /// Duration string such as `"minutes=10"` or `"days=1"`.
    pub token_validity: String,
    pub signing_key_pem: String,
    pub signing_alg: String,
    pub verification_keys: Vec<VerificationKey>,
    pub jwks_sources: Vec<JwksSource>,
    pub created_at: DateTime<Utc>,
}

impl Provider {
    pub fn redirect_uri_patterns(&self) -> impl Iterator<Item = &str> {
        self.redirect_uris
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    /// Parses `token_validity` (`"minutes=10"`, `"days=1"`, `"hours=2"`,
    /// `"seconds=30"`) into a `chrono::Duration`. Falls back to `default`
    /// (itself parsed the same way, or 10 minutes if that's malformed too)
    /// when this provider's own value is unset or malformed.
    pub fn token_validity_duration(&self, default: &str) -> chrono::Duration {
        parse_validity(&self.token_validity)
            .or_else(|| parse_validity(default))
            .unwrap_or_else(|| chrono::Duration::minutes(10))
    }
}

fn parse_validity(s: &str) -> Option<chrono::Duration> {
    let (unit, amount) = s.split_once('=')?;
    let amount: i64 = amount.trim().parse().ok()?;
    match unit.trim() {
        "seconds" => Some(chrono::Duration::seconds(amount)),
        "minutes" => Some(chrono::Duration::minutes(amount)),
        "hours" => Some(chrono::Duration::hours(amount)),
        "days" => Some(chrono::Duration::days(amount)),
        _ => None,
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id_token::IdToken;

/// Mutable only by rotation (`revoked <- true`); never deleted by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub refresh_token: String,
    pub access_token: String,
    pub provider_id: String,
    pub user_uid: String,
    pub scope: Vec<String>,
    pub id_token: Option<IdToken>,
    pub at_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

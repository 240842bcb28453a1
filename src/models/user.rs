use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque identity. `attributes` carries free-form flags such as
/// `GENERATED`/`EXPIRES` set when a user is synthesized from a JWT assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub attributes: HashMap<String, serde_json::Value>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_generated(&self) -> bool {
        self.attributes
            .get("GENERATED")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// An opaque app-password credential used by the `password` grant,
/// identified by `(key, intent=APP_PASSWORD)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPasswordToken {
    pub key_hash: String,
    pub user_uid: String,
    pub intent: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AppPasswordToken {
    pub const INTENT_APP_PASSWORD: &'static str = "APP_PASSWORD";

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }
}

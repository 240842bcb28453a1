use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The policy/audit surface a provider is bound to. A provider with no
/// bound application cannot issue tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

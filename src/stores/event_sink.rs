use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use tracing::warn;
use uuid::Uuid;

/// An audit event: `LOGIN`, `SUSPICIOUS_REQUEST`, `CONFIGURATION_ERROR`.
/// `args` carries event-specific detail (e.g. `{"method": "jwt"}`).
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: &'static str,
    pub client_id: Option<String>,
    pub user_uid: Option<String>,
    pub args: serde_json::Value,
}

impl AuditEvent {
    pub fn login(client_id: impl Into<String>, user_uid: impl Into<String>, method: &str) -> Self {
        AuditEvent {
            event_type: "LOGIN",
            client_id: Some(client_id.into()),
            user_uid: Some(user_uid.into()),
            args: serde_json::json!({ "method": method }),
        }
    }

    /// `LOGIN` event for the JWT-assertion grant; `source`/`jwk_id` identify
    /// which key verified the assertion (absent for a static-certificate
    /// match), `generated` records whether the user was synthesized for this
    /// assertion's `sub` rather than a pre-existing account.
    pub fn login_jwt(
        client_id: impl Into<String>,
        user_uid: impl Into<String>,
        source: Option<&str>,
        jwk_id: Option<&str>,
        generated: bool,
    ) -> Self {
        AuditEvent {
            event_type: "LOGIN",
            client_id: Some(client_id.into()),
            user_uid: Some(user_uid.into()),
            args: serde_json::json!({ "method": "jwt", "source": source, "jwk_id": jwk_id, "generated": generated }),
        }
    }

    pub fn suspicious_request(client_id: impl Into<String>, detail: &str) -> Self {
        AuditEvent {
            event_type: "SUSPICIOUS_REQUEST",
            client_id: Some(client_id.into()),
            user_uid: None,
            args: serde_json::json!({ "detail": detail }),
        }
    }

    pub fn configuration_error(client_id: impl Into<String>, detail: &str) -> Self {
        AuditEvent {
            event_type: "CONFIGURATION_ERROR",
            client_id: Some(client_id.into()),
            user_uid: None,
            args: serde_json::json!({ "detail": detail }),
        }
    }
}

/// Where audit events go. Kept behind a trait so a deployment can swap in
/// whatever its audit pipeline actually is; the shipped adapter writes to
/// the same MySQL pool everything else uses.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
}

#[derive(Clone)]
pub struct MySqlEventSink {
    pool: MySqlPool,
}

impl MySqlEventSink {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for MySqlEventSink {
    async fn emit(&self, event: AuditEvent) {
        let id = Uuid::new_v4().to_string();
        let now: DateTime<Utc> = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO oauth_audit_events (id, event_type, client_id, user_uid, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(event.event_type)
        .bind(&event.client_id)
        .bind(&event.user_uid)
        .bind(&event.args)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            // Audit persistence failing must never fail the request; it's
            // logged instead so operators can still see it in the trace output.
            warn!(error = %e, event_type = event.event_type, "failed to persist audit event");
        }
    }
}

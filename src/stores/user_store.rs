use async_trait::async_trait;
use chrono::Utc;
use sqlx::MySqlPool;
use std::collections::HashMap;

use crate::error::CoreError;
use crate::models::{AppPasswordToken, User};

/// User lookup, plus the upsert a JWT-assertion grant uses to synthesize an
/// ephemeral user for `"{provider.name}-{sub}"`.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, CoreError>;
    async fn find_app_password(&self, key_hash: &str) -> Result<Option<AppPasswordToken>, CoreError>;
    async fn upsert_generated(
        &self,
        username: &str,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<User, CoreError>;
}

#[derive(Clone)]
pub struct MySqlUserStore {
    pool: MySqlPool,
}

impl MySqlUserStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    uid: String,
    username: String,
    password_hash: Option<String>,
    attributes: serde_json::Value,
    last_login: Option<chrono::DateTime<Utc>>,
}

impl UserRow {
    fn into_user(self) -> Result<User, CoreError> {
        let attributes = serde_json::from_value(self.attributes)
            .map_err(|e| CoreError::Store(format!("malformed user attributes: {e}")))?;
        Ok(User {
            uid: self.uid,
            username: self.username,
            password_hash: self.password_hash,
            attributes,
            last_login: self.last_login,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AppPasswordRow {
    key_hash: String,
    user_uid: String,
    intent: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl From<AppPasswordRow> for AppPasswordToken {
    fn from(row: AppPasswordRow) -> Self {
        AppPasswordToken {
            key_hash: row.key_hash,
            user_uid: row.user_uid,
            intent: row.intent,
            expires_at: row.expires_at,
        }
    }
}

#[async_trait]
impl UserStore for MySqlUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, CoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT uid, username, password_hash, attributes, last_login FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("user lookup failed: {e}")))?;

        row.map(UserRow::into_user).transpose()
    }

    async fn find_app_password(&self, key_hash: &str) -> Result<Option<AppPasswordToken>, CoreError> {
        let row = sqlx::query_as::<_, AppPasswordRow>(
            r#"
            SELECT key_hash, user_uid, intent, expires_at
            FROM app_password_tokens
            WHERE key_hash = ? AND intent = ?
            "#,
        )
        .bind(key_hash)
        .bind(AppPasswordToken::INTENT_APP_PASSWORD)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("app password lookup failed: {e}")))?;

        Ok(row.map(AppPasswordToken::from))
    }

    async fn upsert_generated(
        &self,
        username: &str,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<User, CoreError> {
        if let Some(existing) = self.find_by_username(username).await? {
            sqlx::query("UPDATE users SET last_login = ? WHERE uid = ?")
                .bind(Utc::now())
                .bind(&existing.uid)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Store(format!("user last_login update failed: {e}")))?;
            return Ok(existing);
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let mut attributes = HashMap::new();
        attributes.insert("GENERATED".to_string(), serde_json::Value::Bool(true));
        if let Some(exp) = expires_at {
            attributes.insert(
                "EXPIRES".to_string(),
                serde_json::Value::Number(exp.timestamp().into()),
            );
        }
        let attributes_json = serde_json::to_value(&attributes)
            .map_err(|e| CoreError::Store(format!("attribute serialization failed: {e}")))?;

        sqlx::query(
            "INSERT INTO users (uid, username, password_hash, attributes, last_login) VALUES (?, ?, NULL, ?, ?)",
        )
        .bind(&uid)
        .bind(username)
        .bind(&attributes_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("user insert failed: {e}")))?;

        Ok(User {
            uid,
            username: username.to_string(),
            password_hash: None,
            attributes,
            last_login: Some(Utc::now()),
        })
    }
}

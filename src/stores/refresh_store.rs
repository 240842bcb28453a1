use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::error::CoreError;
use crate::models::RefreshToken;
use crate::utils::secret::hash_oauth_token;

/// Durable storage for refresh tokens, with atomic rotation: `revoke`
/// flips `revoked` only if the row was still active, so a replayed refresh
/// token can never revoke twice or race a legitimate rotation (I2/I3).
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn find_active(&self, token: &str, provider_id: &str) -> Result<Option<RefreshToken>, CoreError>;
    async fn persist(&self, token: &RefreshToken) -> Result<(), CoreError>;
    /// Returns `true` if this call revoked the row (i.e. it was active);
    /// `false` means it was already revoked — the caller treats this as a
    /// replay and emits a `SUSPICIOUS_REQUEST` audit event.
    async fn revoke(&self, token: &str, provider_id: &str) -> Result<bool, CoreError>;
}

#[derive(Clone)]
pub struct MySqlRefreshTokenStore {
    pool: MySqlPool,
}

impl MySqlRefreshTokenStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RefreshTokenRow {
    refresh_token_hash: String,
    access_token_hash: String,
    provider_id: String,
    user_uid: String,
    scope: serde_json::Value,
    id_token: Option<serde_json::Value>,
    at_hash: String,
    expires_at: chrono::DateTime<chrono::Utc>,
    revoked: bool,
}

#[async_trait]
impl RefreshTokenStore for MySqlRefreshTokenStore {
    async fn find_active(&self, token: &str, provider_id: &str) -> Result<Option<RefreshToken>, CoreError> {
        let token_hash = hash_oauth_token(token);

        let row = sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            SELECT refresh_token_hash, access_token_hash, provider_id, user_uid, scope,
                   id_token, at_hash, expires_at, revoked
            FROM refresh_tokens
            WHERE refresh_token_hash = ? AND provider_id = ?
            "#,
        )
        .bind(&token_hash)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("refresh token lookup failed: {e}")))?;

        let Some(row) = row else { return Ok(None) };

        let scope: Vec<String> = serde_json::from_value(row.scope)
            .map_err(|e| CoreError::Store(format!("malformed scope: {e}")))?;
        let id_token = row
            .id_token
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoreError::Store(format!("malformed id_token: {e}")))?;

        Ok(Some(RefreshToken {
            refresh_token: token.to_string(),
            access_token: String::new(), // opaque: never read back, only hashed on write
            provider_id: row.provider_id,
            user_uid: row.user_uid,
            scope,
            id_token,
            at_hash: row.at_hash,
            expires_at: row.expires_at,
            revoked: row.revoked,
        }))
    }

    async fn persist(&self, token: &RefreshToken) -> Result<(), CoreError> {
        let scope_json = serde_json::to_value(&token.scope)
            .map_err(|e| CoreError::Store(format!("scope serialization failed: {e}")))?;
        let id_token_json = token
            .id_token
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::Store(format!("id_token serialization failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (refresh_token_hash, access_token_hash, provider_id, user_uid, scope,
                 id_token, at_hash, expires_at, revoked)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, false)
            "#,
        )
        .bind(hash_oauth_token(&token.refresh_token))
        .bind(hash_oauth_token(&token.access_token))
        .bind(&token.provider_id)
        .bind(&token.user_uid)
        .bind(&scope_json)
        .bind(&id_token_json)
        .bind(&token.at_hash)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("refresh token insert failed: {e}")))?;

        Ok(())
    }

    async fn revoke(&self, token: &str, provider_id: &str) -> Result<bool, CoreError> {
        let token_hash = hash_oauth_token(token);

        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = true WHERE refresh_token_hash = ? AND provider_id = ? AND revoked = false",
        )
        .bind(&token_hash)
        .bind(provider_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("refresh token revoke failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::error::CoreError;
use crate::models::{AuthorizationCode, CodeChallengeMethod};
use crate::utils::secret::hash_oauth_token;

/// Durable storage for authorization codes. Lookup is non-destructive so a
/// request that fails validation *after* the lookup (e.g. a bad
/// `redirect_uri`) leaves the code untouched; only `delete_if_present` is
/// destructive, and it is the atomicity boundary for I1: it reports
/// `true` to at most one caller even under concurrent exchange of the
/// same code, and the caller only mints a token when it gets `true`.
#[async_trait]
pub trait CodeStore: Send + Sync {
    async fn find(&self, code: &str, provider_id: &str) -> Result<Option<AuthorizationCode>, CoreError>;
    async fn delete_if_present(&self, code: &str, provider_id: &str) -> Result<bool, CoreError>;
}

#[derive(Clone)]
pub struct MySqlCodeStore {
    pool: MySqlPool,
}

impl MySqlCodeStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CodeRow {
    code_hash: String,
    provider_id: String,
    user_uid: String,
    scope: serde_json::Value,
    nonce: Option<String>,
    is_open_id: bool,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl CodeStore for MySqlCodeStore {
    async fn find(&self, code: &str, provider_id: &str) -> Result<Option<AuthorizationCode>, CoreError> {
        let code_hash = hash_oauth_token(code);

        let row = sqlx::query_as::<_, CodeRow>(
            r#"
            SELECT code_hash, provider_id, user_uid, scope, nonce, is_open_id,
                   code_challenge, code_challenge_method, expires_at
            FROM authorization_codes
            WHERE code_hash = ? AND provider_id = ?
            "#,
        )
        .bind(&code_hash)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("authorization code lookup failed: {e}")))?;

        let Some(row) = row else { return Ok(None) };

        let scope: Vec<String> = serde_json::from_value(row.scope)
            .map_err(|e| CoreError::Store(format!("malformed scope: {e}")))?;
        let code_challenge_method = row
            .code_challenge_method
            .as_deref()
            .and_then(CodeChallengeMethod::from_db);

        Ok(Some(AuthorizationCode {
            code: code.to_string(),
            provider_id: row.provider_id,
            user_uid: row.user_uid,
            scope,
            nonce: row.nonce,
            is_open_id: row.is_open_id,
            code_challenge: row.code_challenge,
            code_challenge_method,
            expires_at: row.expires_at,
        }))
    }

    async fn delete_if_present(&self, code: &str, provider_id: &str) -> Result<bool, CoreError> {
        let code_hash = hash_oauth_token(code);

        let deleted = sqlx::query("DELETE FROM authorization_codes WHERE code_hash = ? AND provider_id = ?")
            .bind(&code_hash)
            .bind(provider_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Store(format!("authorization code delete failed: {e}")))?;

        Ok(deleted.rows_affected() > 0)
    }
}

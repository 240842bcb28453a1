use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::error::CoreError;
use crate::models::{Application, Provider};

/// Lookup surface for registered OAuth clients and the application each is
/// bound to. The authorization endpoint that creates providers is out of
/// scope; this core only reads.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Provider>, CoreError>;
    async fn find_application(&self, provider_id: &str) -> Result<Option<Application>, CoreError>;
}

/// `sqlx`/MySQL-backed `ProviderStore`, following the repository pattern
/// used throughout this codebase: a thin wrapper around a pool with one
/// query per method and `rows_affected`/`fetch_optional` error mapping.
#[derive(Clone)]
pub struct MySqlProviderStore {
    pool: MySqlPool,
}

impl MySqlProviderStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: String,
    client_id: String,
    client_secret_hash: Option<String>,
    client_type: String,
    name: String,
    redirect_uris: String,
    token_validity: String,
    signing_key_pem: String,
    signing_alg: String,
    verification_keys: serde_json::Value,
    jwks_sources: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl ProviderRow {
    fn into_provider(self) -> Result<Provider, CoreError> {
        let verification_keys = serde_json::from_value(self.verification_keys)
            .map_err(|e| CoreError::Store(format!("malformed verification_keys: {e}")))?;
        let jwks_sources = serde_json::from_value(self.jwks_sources)
            .map_err(|e| CoreError::Store(format!("malformed jwks_sources: {e}")))?;

        Ok(Provider {
            id: self.id,
            client_id: self.client_id,
            client_secret_hash: self.client_secret_hash,
            client_type: crate::models::ClientType::from_db(&self.client_type),
            name: self.name,
            redirect_uris: self.redirect_uris,
            token_validity: self.token_validity,
            signing_key_pem: self.signing_key_pem,
            signing_alg: self.signing_alg,
            verification_keys,
            jwks_sources,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    id: String,
    provider_id: String,
    name: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<ApplicationRow> for Application {
    fn from(row: ApplicationRow) -> Self {
        Application {
            id: row.id,
            provider_id: row.provider_id,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl ProviderStore for MySqlProviderStore {
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Provider>, CoreError> {
        let row = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT id, client_id, client_secret_hash, client_type, name, redirect_uris,
                   token_validity, signing_key_pem, signing_alg, verification_keys,
                   jwks_sources, created_at
            FROM providers
            WHERE client_id = ?
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("provider lookup failed: {e}")))?;

        row.map(ProviderRow::into_provider).transpose()
    }

    async fn find_application(&self, provider_id: &str) -> Result<Option<Application>, CoreError> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT id, provider_id, name, created_at
            FROM applications
            WHERE provider_id = ?
            "#,
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Store(format!("application lookup failed: {e}")))?;

        Ok(row.map(Application::from))
    }
}

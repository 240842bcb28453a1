//! RFC 7523 client-assertion verification (§4.3): two passes over a
//! provider's configured key material, short-circuiting at the first valid
//! signature, followed by expiry check, application lookup, policy gate, and
//! ephemeral-user synthesis.

use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use std::collections::HashMap;

use crate::error::{CoreError, TokenError};
use crate::models::{Application, Provider, User};
use crate::stores::{AuditEvent, EventSink, JwksFetcher, PolicyContext, PolicyEngine, ProviderStore, UserStore};
use crate::utils::jwt::{
    decode_assertion_with_key, decoding_key_from_certificate, decoding_key_from_jwk,
    decoding_key_from_private_key, AssertionClaims,
};

const JWT_BEARER_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub struct JwtAssertionOutcome {
    pub user: User,
    pub application: Application,
}

pub struct JwtAssertionVerifier<'a> {
    pub jwks_fetcher: JwksFetcher<'a>,
    pub provider_store: &'a dyn ProviderStore,
    pub user_store: &'a dyn UserStore,
    pub policy_engine: &'a dyn PolicyEngine,
    pub event_sink: &'a dyn EventSink,
    pub now: DateTime<Utc>,
}

struct Verified {
    claims: AssertionClaims,
    source: Option<String>,
    jwk_id: Option<String>,
}

impl<'a> JwtAssertionVerifier<'a> {
    pub async fn verify(
        &self,
        provider: &Provider,
        assertion_type: &str,
        assertion: &str,
        scope: &[String],
    ) -> Result<JwtAssertionOutcome, TokenError> {
        if assertion_type != JWT_BEARER_ASSERTION_TYPE {
            return Err(TokenError::invalid_grant("unsupported client_assertion_type"));
        }

        let verified = self
            .verify_signature(provider, assertion)
            .await
            .ok_or_else(|| TokenError::invalid_grant("client assertion verification failed"))?;

        if verified.claims.is_expired(self.now.timestamp()) {
            return Err(TokenError::invalid_grant("client assertion expired"));
        }

        let application = self
            .provider_store
            .find_application(&provider.id)
            .await
            .map_err(|_| TokenError::invalid_grant("application lookup failed"))?
            .ok_or_else(|| TokenError::invalid_grant("no application bound to provider"))?;

        let username = format!("{}-{}", provider.name, verified.claims.sub);
        let expires_at = verified
            .claims
            .exp
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));
        let user = self
            .user_store
            .upsert_generated(&username, expires_at)
            .await
            .map_err(|_| TokenError::invalid_grant("user synthesis failed"))?;

        let mut ctx = PolicyContext {
            scopes: scope.to_vec(),
            grant_type: "client_credentials".to_string(),
            extra: HashMap::new(),
        };
        ctx.extra.insert(
            "oauth_jwt".to_string(),
            serde_json::to_value(&verified.claims).unwrap_or(serde_json::Value::Null),
        );

        let decision = self.policy_engine.evaluate(&application, &user, &ctx).await;
        if !decision.passing {
            return Err(TokenError::invalid_grant("policy denied"));
        }

        self.event_sink
            .emit(AuditEvent::login_jwt(
                provider.client_id.clone(),
                user.uid.clone(),
                verified.source.as_deref(),
                verified.jwk_id.as_deref(),
                user.is_generated(),
            ))
            .await;

        Ok(JwtAssertionOutcome { user, application })
    }

    async fn verify_signature(&self, provider: &Provider, token: &str) -> Option<Verified> {
        for vk in &provider.verification_keys {
            // Prefer the public half of a registered private key over the
            // certificate's own public key: the certificate can go stale
            // relative to a rotated private key, and the private key is the
            // more current source of truth when both are present.
            let preferred_key = vk.private_key_pem.as_deref().and_then(|pem| decoding_key_from_private_key(pem).ok());
            let key = match preferred_key.or_else(|| decoding_key_from_certificate(&vk.certificate_pem).ok()) {
                Some(key) => key,
                None => continue,
            };
            for alg in [Algorithm::RS256, Algorithm::ES256] {
                if let Some(claims) = decode_assertion_with_key(token, &key, alg) {
                    return Some(Verified {
                        claims,
                        source: None,
                        jwk_id: Some(vk.name.clone()),
                    });
                }
            }
        }

        for src in &provider.jwks_sources {
            let keys = match self.jwks_fetcher.fetch_keys(src).await {
                Ok(keys) => keys,
                Err(CoreError::Store(e)) => {
                    tracing::warn!(source = %src.name, error = %e, "jwks source unavailable during assertion verification");
                    continue;
                }
                Err(_) => continue,
            };

            for jwk in &keys {
                let Ok((key, alg)) = decoding_key_from_jwk(jwk) else {
                    continue;
                };
                if let Some(claims) = decode_assertion_with_key(token, &key, alg) {
                    let jwk_id = jwk.get("kid").and_then(|v| v.as_str()).map(String::from);
                    return Some(Verified {
                        claims,
                        source: Some(src.name.clone()),
                        jwk_id,
                    });
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::sync::Mutex;

    use crate::config::JwksCache;
    use crate::models::{ClientType, VerificationKey};
    use crate::stores::policy_engine::AllowAllPolicyEngine;

    const TEST_PRIVATE_KEY: &str = include_str!("../../keys/private.pem");
    // A different, unrelated RSA keypair's public half: stands in for a
    // provider's certificate that has gone stale relative to a rotated
    // private key, so decoding against it alone would fail to verify.
    const STALE_CERTIFICATE: &str = include_str!("../../keys/stale_public.pem");

    struct StubProviderStore;

    #[async_trait]
    impl ProviderStore for StubProviderStore {
        async fn find_by_client_id(&self, _client_id: &str) -> Result<Option<Provider>, CoreError> {
            Ok(None)
        }

        async fn find_application(&self, provider_id: &str) -> Result<Option<Application>, CoreError> {
            Ok(Some(Application {
                id: "app1".into(),
                provider_id: provider_id.to_string(),
                name: "acme app".into(),
                created_at: Utc::now(),
            }))
        }
    }

    #[derive(Default)]
    struct StubUserStore {
        generated: Mutex<HashMap<String, User>>,
    }

    #[async_trait]
    impl UserStore for StubUserStore {
        async fn find_by_username(&self, username: &str) -> Result<Option<User>, CoreError> {
            Ok(self.generated.lock().unwrap().get(username).cloned())
        }

        async fn find_app_password(
            &self,
            _key_hash: &str,
        ) -> Result<Option<crate::models::AppPasswordToken>, CoreError> {
            Ok(None)
        }

        async fn upsert_generated(
            &self,
            username: &str,
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<User, CoreError> {
            let mut generated = self.generated.lock().unwrap();
            if let Some(existing) = generated.get(username) {
                return Ok(existing.clone());
            }
            let user = User {
                uid: format!("uid-{username}"),
                username: username.to_string(),
                password_hash: None,
                attributes: HashMap::new(),
                last_login: Some(Utc::now()),
            };
            generated.insert(username.to_string(), user.clone());
            Ok(user)
        }
    }

    #[derive(Default)]
    struct StubEventSink;

    #[async_trait]
    impl EventSink for StubEventSink {
        async fn emit(&self, _event: AuditEvent) {}
    }

    fn provider_with_rotated_key() -> Provider {
        Provider {
            id: "p1".into(),
            client_id: "client-1".into(),
            client_secret_hash: None,
            client_type: ClientType::Confidential,
            name: "acme".into(),
            redirect_uris: String::new(),
            token_validity: "minutes=10".into(),
            signing_key_pem: String::new(),
            signing_alg: "RS256".into(),
            verification_keys: vec![VerificationKey {
                name: "k1".into(),
                certificate_pem: STALE_CERTIFICATE.to_string(),
                private_key_pem: Some(TEST_PRIVATE_KEY.to_string()),
            }],
            jwks_sources: vec![],
            created_at: Utc::now(),
        }
    }

    // The provider's registered certificate has gone stale, but the assertion
    // is signed with the (still current) private key also registered on the
    // `VerificationKey` — the private-key-derived decoding key must win.
    #[tokio::test]
    async fn verify_prefers_the_private_keys_public_half_over_a_stale_certificate() {
        let provider = provider_with_rotated_key();
        let now = Utc::now();

        #[derive(Serialize)]
        struct Assertion {
            sub: String,
            exp: i64,
        }
        let encoding_key = EncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &Assertion { sub: "sub-1".into(), exp: (now + chrono::Duration::minutes(5)).timestamp() },
            &encoding_key,
        )
        .unwrap();

        let provider_store = StubProviderStore;
        let user_store = StubUserStore::default();
        let policy_engine = AllowAllPolicyEngine;
        let event_sink = StubEventSink;
        let jwks_cache = JwksCache::default();
        let http_client = reqwest::Client::new();

        let verifier = JwtAssertionVerifier {
            jwks_fetcher: JwksFetcher::new(&http_client, &jwks_cache, 300),
            provider_store: &provider_store,
            user_store: &user_store,
            policy_engine: &policy_engine,
            event_sink: &event_sink,
            now,
        };

        let outcome = verifier
            .verify(&provider, JWT_BEARER_ASSERTION_TYPE, &assertion, &[])
            .await
            .expect("assertion signed by the rotated private key must verify");
        assert_eq!(outcome.user.username, "acme-sub-1");

        // Sanity check: verifying against the stale certificate alone fails,
        // confirming the test actually exercises the preference, not a
        // false pass from both keys happening to agree.
        let stale_key = decoding_key_from_certificate(STALE_CERTIFICATE).unwrap();
        assert!(decode_assertion_with_key(&assertion, &stale_key, Algorithm::RS256).is_none());
    }
}

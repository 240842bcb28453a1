//! §4.6: wires `ClientAuthenticator` → `ProviderStore` → `GrantValidator` →
//! `TokenMinter` into the three response builders. Code consumption and
//! refresh rotation happen as the last step before minting, once every
//! other validation has already passed — see `CodeStore`/`RefreshTokenStore`
//! doc comments for why that ordering is the I1/I2/I3 atomicity boundary.

use chrono::{DateTime, Utc};

use crate::config::{JwksCache, KeyCache, RedirectPatternCache};
use crate::dto::token::{TokenRequestForm, TokenResponseBody};
use crate::error::{CoreFailure, TokenError};
use crate::models::{AuthorizationCode, Provider, RefreshToken};
use crate::services::client_authenticator::ClientAuthenticator;
use crate::services::grant_validator::{GrantValidator, TokenParams};
use crate::services::jwt_assertion_verifier::JwtAssertionVerifier;
use crate::services::policy_gate::PolicyGate;
use crate::services::token_minter::TokenMinter;
use crate::stores::{AuditEvent, CodeStore, EventSink, JwksFetcher, PolicyEngine, ProviderStore, RefreshTokenStore, UserStore};

pub struct TokenEndpointDeps<'a> {
    pub provider_store: &'a dyn ProviderStore,
    pub code_store: &'a dyn CodeStore,
    pub refresh_store: &'a dyn RefreshTokenStore,
    pub user_store: &'a dyn UserStore,
    pub policy_engine: &'a dyn PolicyEngine,
    pub event_sink: &'a dyn EventSink,
    pub redirect_cache: &'a RedirectPatternCache,
    pub key_cache: &'a KeyCache,
    pub http_client: &'a reqwest::Client,
    pub jwks_cache: &'a JwksCache,
    pub jwks_ttl_secs: u64,
    pub issuer: &'a str,
    pub default_token_validity: &'a str,
    pub now: DateTime<Utc>,
}

impl<'a> TokenEndpointDeps<'a> {
    pub async fn handle(
        &self,
        form: &TokenRequestForm,
        authorization_header: Option<&str>,
    ) -> Result<TokenResponseBody, CoreFailure> {
        let creds = ClientAuthenticator::extract(authorization_header, form)?;
        let client_id = creds
            .client_id
            .as_deref()
            .ok_or_else(|| TokenError::invalid_client("missing client_id"))?;

        let provider = self
            .provider_store
            .find_by_client_id(client_id)
            .await?
            .ok_or_else(|| TokenError::invalid_client("unknown client"))?;

        ClientAuthenticator::verify_secret(&provider, &form.grant_type, creds.client_secret.as_deref())?;

        let jwks_fetcher = JwksFetcher::new(self.http_client, self.jwks_cache, self.jwks_ttl_secs);
        let jwt_verifier = JwtAssertionVerifier {
            jwks_fetcher,
            provider_store: self.provider_store,
            user_store: self.user_store,
            policy_engine: self.policy_engine,
            event_sink: self.event_sink,
            now: self.now,
        };
        let policy_gate = PolicyGate { engine: self.policy_engine };
        let validator = GrantValidator {
            code_store: self.code_store,
            refresh_store: self.refresh_store,
            user_store: self.user_store,
            provider_store: self.provider_store,
            event_sink: self.event_sink,
            redirect_cache: self.redirect_cache,
            policy_gate,
            jwt_verifier,
            now: self.now,
        };

        let params = validator.parse(form, &provider).await?;
        let minter = TokenMinter {
            key_cache: self.key_cache,
            issuer: self.issuer,
            default_token_validity: self.default_token_validity,
            now: self.now,
        };

        match params {
            TokenParams::AuthorizationCode { code } => self.create_code_response(&provider, code, &minter).await,
            TokenParams::RefreshToken { previous, requested_scope } => {
                self.create_refresh_response(&provider, previous, requested_scope, &minter).await
            }
            TokenParams::ClientCredentials { user, scope, .. } => {
                self.create_client_credentials_response(&provider, &user.uid, scope, &minter).await
            }
            TokenParams::Password { user, scope, .. } => {
                self.create_client_credentials_response(&provider, &user.uid, scope, &minter).await
            }
            TokenParams::JwtAssertion { user, scope, .. } => {
                self.create_client_credentials_response(&provider, &user.uid, scope, &minter).await
            }
        }
    }

    /// §4.6.3. Mints `R` bound to the code's `(user, scope)`, attaches an ID
    /// token when the code was opened for OIDC, persists, then deletes the
    /// code — the atomic I1 boundary, performed only once every prior check
    /// has already passed.
    async fn create_code_response(
        &self,
        provider: &Provider,
        code: AuthorizationCode,
        minter: &TokenMinter<'_>,
    ) -> Result<TokenResponseBody, CoreFailure> {
        let mut token = minter.mint(provider, &code.user_uid, code.scope.clone());

        if code.is_open_id {
            let claims = minter.create_id_token(provider, &token, code.nonce.clone());
            token.id_token = Some(claims);
        }

        self.refresh_store.persist(&token).await?;

        if !self.code_store.delete_if_present(&code.code, &provider.id).await? {
            // Lost the race to a concurrent exchange of the same code; the
            // token we just persisted is simply orphaned (never returned).
            return Err(TokenError::invalid_grant("authorization code already consumed").into());
        }

        self.finish(provider, &token, minter)
    }

    /// §4.6.4. Rejects scope widening, mints `R_new`, revokes `R_prev`
    /// atomically, and carries a new ID token forward when the prior grant
    /// had one.
    async fn create_refresh_response(
        &self,
        provider: &Provider,
        previous: RefreshToken,
        requested_scope: Vec<String>,
        minter: &TokenMinter<'_>,
    ) -> Result<TokenResponseBody, CoreFailure> {
        if requested_scope.iter().any(|s| !previous.scope.contains(s)) {
            return Err(TokenError::invalid_scope("requested scope exceeds the refresh token's scope").into());
        }

        if !self.refresh_store.revoke(&previous.refresh_token, &provider.id).await? {
            // Already revoked by a concurrent exchange — I3.
            self.event_sink
                .emit(AuditEvent::suspicious_request(provider.client_id.clone(), "refresh token reuse detected"))
                .await;
            return Err(TokenError::invalid_grant("refresh token already revoked").into());
        }

        let mut new_token = minter.mint(provider, &previous.user_uid, requested_scope);

        if previous.id_token.is_some() {
            let claims = minter.create_id_token(provider, &new_token, None);
            new_token.id_token = Some(claims);
        }

        self.refresh_store.persist(&new_token).await?;

        self.finish(provider, &new_token, minter)
    }

    /// §4.6.5. No refresh token is issued; an ID token is always attached.
    async fn create_client_credentials_response(
        &self,
        provider: &Provider,
        user_uid: &str,
        scope: Vec<String>,
        minter: &TokenMinter<'_>,
    ) -> Result<TokenResponseBody, CoreFailure> {
        let mut token = minter.mint(provider, user_uid, scope);
        let claims = minter.create_id_token(provider, &token, None);
        token.id_token = Some(claims);

        self.refresh_store.persist(&token).await?;

        let expires_in = (token.expires_at - self.now).num_seconds().max(0);
        let jws = minter.encode(provider, token.id_token.as_ref().expect("attached above"))?;
        let body = TokenResponseBody::new(token.access_token.clone(), expires_in).with_id_token(jws);
        Ok(body)
    }

    /// Shared response assembly for the two grants that may issue a
    /// `refresh_token`: code exchange always does, refresh rotation always
    /// does (it mints a replacement), client_credentials never does.
    fn finish(
        &self,
        provider: &Provider,
        token: &RefreshToken,
        minter: &TokenMinter<'_>,
    ) -> Result<TokenResponseBody, CoreFailure> {
        let expires_in = (token.expires_at - self.now).num_seconds().max(0);
        let mut body = TokenResponseBody::new(token.access_token.clone(), expires_in)
            .with_refresh_token(token.refresh_token.clone());

        if let Some(claims) = &token.id_token {
            let jws = minter.encode(provider, claims)?;
            body = body.with_id_token(jws);
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
    use serde::Serialize;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::config::{JwksCache, KeyCache, RedirectPatternCache};
    use crate::error::CoreError;
    use crate::models::{Application, ClientType, User, VerificationKey};
    use crate::stores::policy_engine::AllowAllPolicyEngine;
    use crate::utils::jwt::compute_at_hash;

    const TEST_PRIVATE_KEY: &str = include_str!("../../keys/private.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../../keys/public.pem");

    fn provider(client_type: ClientType) -> Provider {
        Provider {
            id: "p1".into(),
            client_id: "client-1".into(),
            client_secret_hash: None,
            client_type,
            name: "acme".into(),
            redirect_uris: "^https://app\\.example/cb$".into(),
            token_validity: "minutes=10".into(),
            signing_key_pem: TEST_PRIVATE_KEY.to_string(),
            signing_alg: "RS256".into(),
            verification_keys: vec![VerificationKey {
                name: "k1".into(),
                certificate_pem: TEST_PUBLIC_KEY.to_string(),
                private_key_pem: None,
            }],
            jwks_sources: vec![],
            created_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct MockCodeStore {
        codes: Mutex<HashMap<(String, String), AuthorizationCode>>,
    }

    impl MockCodeStore {
        fn insert(&self, code: AuthorizationCode) {
            self.codes
                .lock()
                .unwrap()
                .insert((code.code.clone(), code.provider_id.clone()), code);
        }

        fn contains(&self, code: &str, provider_id: &str) -> bool {
            self.codes
                .lock()
                .unwrap()
                .contains_key(&(code.to_string(), provider_id.to_string()))
        }
    }

    #[async_trait]
    impl CodeStore for MockCodeStore {
        async fn find(&self, code: &str, provider_id: &str) -> Result<Option<AuthorizationCode>, CoreError> {
            Ok(self
                .codes
                .lock()
                .unwrap()
                .get(&(code.to_string(), provider_id.to_string()))
                .cloned())
        }

        async fn delete_if_present(&self, code: &str, provider_id: &str) -> Result<bool, CoreError> {
            Ok(self
                .codes
                .lock()
                .unwrap()
                .remove(&(code.to_string(), provider_id.to_string()))
                .is_some())
        }
    }

    #[derive(Default)]
    struct MockRefreshStore {
        tokens: Mutex<HashMap<(String, String), RefreshToken>>,
    }

    impl MockRefreshStore {
        fn insert(&self, token: RefreshToken) {
            self.tokens
                .lock()
                .unwrap()
                .insert((token.refresh_token.clone(), token.provider_id.clone()), token);
        }

        fn revoked(&self, token: &str, provider_id: &str) -> bool {
            self.tokens
                .lock()
                .unwrap()
                .get(&(token.to_string(), provider_id.to_string()))
                .map(|t| t.revoked)
                .unwrap_or(false)
        }
    }

    #[async_trait]
    impl RefreshTokenStore for MockRefreshStore {
        async fn find_active(&self, token: &str, provider_id: &str) -> Result<Option<RefreshToken>, CoreError> {
            Ok(self
                .tokens
                .lock()
                .unwrap()
                .get(&(token.to_string(), provider_id.to_string()))
                .cloned())
        }

        async fn persist(&self, token: &RefreshToken) -> Result<(), CoreError> {
            self.insert(token.clone());
            Ok(())
        }

        async fn revoke(&self, token: &str, provider_id: &str) -> Result<bool, CoreError> {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens.get_mut(&(token.to_string(), provider_id.to_string())) {
                Some(t) if !t.revoked => {
                    t.revoked = true;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[derive(Default)]
    struct MockUserStore {
        generated: Mutex<HashMap<String, User>>,
    }

    #[async_trait]
    impl UserStore for MockUserStore {
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
            let mut attributes = HashMap::new();
            attributes.insert("GENERATED".to_string(), serde_json::Value::Bool(true));
            let user = User {
                uid: format!("uid-{username}"),
                username: username.to_string(),
                password_hash: None,
                attributes,
                last_login: Some(Utc::now()),
            };
            generated.insert(username.to_string(), user.clone());
            Ok(user)
        }
    }

    struct MockProviderStore {
        provider: Provider,
        application: Application,
    }

    #[async_trait]
    impl ProviderStore for MockProviderStore {
        async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Provider>, CoreError> {
            if client_id == self.provider.client_id {
                Ok(Some(self.provider.clone()))
            } else {
                Ok(None)
            }
        }

        async fn find_application(&self, provider_id: &str) -> Result<Option<Application>, CoreError> {
            if provider_id == self.provider.id {
                Ok(Some(self.application.clone()))
            } else {
                Ok(None)
            }
        }
    }

    #[derive(Default)]
    struct MockEventSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl EventSink for MockEventSink {
        async fn emit(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        code_store: MockCodeStore,
        refresh_store: MockRefreshStore,
        user_store: MockUserStore,
        provider_store: MockProviderStore,
        policy_engine: AllowAllPolicyEngine,
        event_sink: MockEventSink,
        redirect_cache: RedirectPatternCache,
        key_cache: KeyCache,
        jwks_cache: JwksCache,
        http_client: reqwest::Client,
    }

    impl Harness {
        fn new(provider: Provider) -> Self {
            let application = Application {
                id: "app1".into(),
                provider_id: provider.id.clone(),
                name: "acme app".into(),
                created_at: Utc::now(),
            };
            Harness {
                code_store: MockCodeStore::default(),
                refresh_store: MockRefreshStore::default(),
                user_store: MockUserStore::default(),
                provider_store: MockProviderStore { provider, application },
                policy_engine: AllowAllPolicyEngine,
                event_sink: MockEventSink::default(),
                redirect_cache: RedirectPatternCache::default(),
                key_cache: KeyCache::default(),
                jwks_cache: JwksCache::default(),
                http_client: reqwest::Client::new(),
            }
        }

        fn deps(&self, now: DateTime<Utc>) -> TokenEndpointDeps<'_> {
            TokenEndpointDeps {
                provider_store: &self.provider_store,
                code_store: &self.code_store,
                refresh_store: &self.refresh_store,
                user_store: &self.user_store,
                policy_engine: &self.policy_engine,
                event_sink: &self.event_sink,
                redirect_cache: &self.redirect_cache,
                key_cache: &self.key_cache,
                http_client: &self.http_client,
                jwks_cache: &self.jwks_cache,
                jwks_ttl_secs: 300,
                issuer: "https://issuer.example",
                default_token_validity: "minutes=10",
                now,
            }
        }
    }

    fn form(grant_type: &str) -> TokenRequestForm {
        TokenRequestForm {
            grant_type: grant_type.to_string(),
            client_id: Some("client-1".to_string()),
            ..Default::default()
        }
    }

    // S1 — code exchange with PKCE and OIDC.
    #[tokio::test]
    async fn code_exchange_mints_bound_id_token_and_consumes_the_code() {
        let harness = Harness::new(provider(ClientType::Public));
        let now = Utc::now();

        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

        harness.code_store.insert(AuthorizationCode {
            code: "abc".into(),
            provider_id: "p1".into(),
            user_uid: "u1".into(),
            scope: vec!["openid".into(), "email".into()],
            nonce: Some("n1".into()),
            is_open_id: true,
            code_challenge: Some(challenge.to_string()),
            code_challenge_method: Some(CodeChallengeMethod::S256),
            expires_at: now + chrono::Duration::minutes(5),
        });

        let mut req = form("authorization_code");
        req.code = Some("abc".into());
        req.redirect_uri = Some("https://app.example/cb".into());
        req.code_verifier = Some(verifier.into());

        let body = harness.deps(now).handle(&req, None).await.expect("code exchange should succeed");

        assert!(body.refresh_token.is_some());
        assert_eq!(body.token_type, "bearer");
        assert_eq!(body.expires_in, 600);
        let jws = body.id_token.expect("oidc code carries an id_token");

        let decoding_key = DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client-1"]);
        let claims = decode::<IdToken>(&jws, &decoding_key, &validation).unwrap().claims;
        assert_eq!(claims.nonce.as_deref(), Some("n1"));
        assert_eq!(claims.at_hash, compute_at_hash(&body.access_token));

        assert!(!harness.code_store.contains("abc", "p1"));
    }

    // S2 — reusing an already-consumed code fails closed.
    #[tokio::test]
    async fn code_reuse_is_rejected() {
        let harness = Harness::new(provider(ClientType::Public));
        let now = Utc::now();

        harness.code_store.insert(AuthorizationCode {
            code: "once".into(),
            provider_id: "p1".into(),
            user_uid: "u1".into(),
            scope: vec!["openid".into()],
            nonce: None,
            is_open_id: false,
            code_challenge: None,
            code_challenge_method: None,
            expires_at: now + chrono::Duration::minutes(5),
        });

        let mut req = form("authorization_code");
        req.code = Some("once".into());
        req.redirect_uri = Some("https://app.example/cb".into());

        harness.deps(now).handle(&req, None).await.expect("first exchange succeeds");

        let failure = harness.deps(now).handle(&req, None).await.expect_err("second exchange must fail");
        assert!(matches!(failure, CoreFailure::Token(TokenError::InvalidGrant(_))));
    }

    // S3 — refresh rotation revokes the old token; replay is flagged suspicious.
    #[tokio::test]
    async fn refresh_rotation_revokes_previous_and_rejects_replay() {
        let harness = Harness::new(provider(ClientType::Public));
        let now = Utc::now();

        harness.refresh_store.insert(RefreshToken {
            refresh_token: "old-rt".into(),
            access_token: "old-at".into(),
            provider_id: "p1".into(),
            user_uid: "u1".into(),
            scope: vec!["a".into(), "b".into()],
            id_token: None,
            at_hash: compute_at_hash("old-at"),
            expires_at: now + chrono::Duration::minutes(10),
            revoked: false,
        });

        let mut req = form("refresh_token");
        req.refresh_token = Some("old-rt".into());
        req.scope = Some("a".into());

        let body = harness.deps(now).handle(&req, None).await.expect("rotation should succeed");
        assert_ne!(body.refresh_token.as_deref(), Some("old-rt"));
        assert!(harness.refresh_store.revoked("old-rt", "p1"));

        let failure = harness.deps(now).handle(&req, None).await.expect_err("replay must be rejected");
        assert!(matches!(failure, CoreFailure::Token(TokenError::InvalidGrant(_))));

        let events = harness.event_sink.events.lock().unwrap();
        assert!(events.iter().any(|e| e.event_type == "SUSPICIOUS_REQUEST"));
    }

    // S4 — a refresh request may not widen its originating scope.
    #[tokio::test]
    async fn refresh_scope_widening_is_rejected() {
        let harness = Harness::new(provider(ClientType::Public));
        let now = Utc::now();

        harness.refresh_store.insert(RefreshToken {
            refresh_token: "rt2".into(),
            access_token: "at2".into(),
            provider_id: "p1".into(),
            user_uid: "u1".into(),
            scope: vec!["a".into()],
            id_token: None,
            at_hash: compute_at_hash("at2"),
            expires_at: now + chrono::Duration::minutes(10),
            revoked: false,
        });

        let mut req = form("refresh_token");
        req.refresh_token = Some("rt2".into());
        req.scope = Some("a b".into());

        let failure = harness.deps(now).handle(&req, None).await.expect_err("widened scope must be rejected");
        assert!(matches!(failure, CoreFailure::Token(TokenError::InvalidScope(_))));
    }

    // S5 — client_credentials authenticated by an RFC 7523 JWT assertion,
    // verified against the provider's static certificate (pass 1).
    #[tokio::test]
    async fn client_credentials_via_jwt_assertion_synthesizes_a_user() {
        let harness = Harness::new(provider(ClientType::Confidential));
        let now = Utc::now();

        #[derive(Serialize)]
        struct Assertion {
            sub: String,
            exp: i64,
        }
        let encoding_key = EncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &Assertion { sub: "sub-42".into(), exp: (now + chrono::Duration::minutes(5)).timestamp() },
            &encoding_key,
        )
        .unwrap();

        let mut req = form("client_credentials");
        req.client_assertion_type = Some("urn:ietf:params:oauth:client-assertion-type:jwt-bearer".into());
        req.client_assertion = Some(assertion);

        let body = harness.deps(now).handle(&req, None).await.expect("jwt assertion grant should succeed");
        assert!(body.refresh_token.is_none());
        assert!(body.id_token.is_some());

        let user = harness.user_store.generated.lock().unwrap().get("acme-sub-42").cloned();
        assert!(user.is_some(), "a user should have been synthesized for the JWT subject");

        let events = harness.event_sink.events.lock().unwrap();
        assert!(events.iter().any(|e| e.event_type == "LOGIN"));
    }

    // S6 — an unrecognized grant_type is rejected before any store is touched.
    #[tokio::test]
    async fn unknown_grant_type_is_rejected() {
        let harness = Harness::new(provider(ClientType::Public));
        let req = form("device_code");

        let failure = harness.deps(Utc::now()).handle(&req, None).await.expect_err("unknown grant must fail");
        assert!(matches!(failure, CoreFailure::Token(TokenError::UnsupportedGrantType)));
    }

    // S7 — a redirect_uri mismatch fails the exchange without consuming the code.
    #[tokio::test]
    async fn redirect_uri_mismatch_leaves_the_code_intact() {
        let harness = Harness::new(provider(ClientType::Public));
        let now = Utc::now();

        harness.code_store.insert(AuthorizationCode {
            code: "c2".into(),
            provider_id: "p1".into(),
            user_uid: "u1".into(),
            scope: vec!["openid".into()],
            nonce: None,
            is_open_id: false,
            code_challenge: None,
            code_challenge_method: None,
            expires_at: now + chrono::Duration::minutes(5),
        });

        let mut req = form("authorization_code");
        req.code = Some("c2".into());
        req.redirect_uri = Some("https://evil.example/cb".into());

        let failure = harness.deps(now).handle(&req, None).await.expect_err("mismatched redirect_uri must fail");
        assert!(matches!(failure, CoreFailure::Token(TokenError::InvalidClient(_))));
        assert!(harness.code_store.contains("c2", "p1"));
    }
}

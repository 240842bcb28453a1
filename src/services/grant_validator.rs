//! §4.2: per-grant input parsing and invariant checking. `parse` resolves a
//! request into a `TokenParams` variant whose shape already encodes which
//! preconditions hold — by the time `TokenEndpoint` matches on it, the
//! resolved `AuthorizationCode`/`RefreshToken`/`User` is no longer optional.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;

use crate::config::RedirectPatternCache;
use crate::dto::token::TokenRequestForm;
use crate::error::TokenError;
use crate::models::{Application, AuthorizationCode, Provider, RefreshToken, User};
use crate::services::jwt_assertion_verifier::JwtAssertionVerifier;
use crate::services::policy_gate::PolicyGate;
use crate::stores::{AuditEvent, CodeStore, EventSink, ProviderStore, RefreshTokenStore, UserStore};
use crate::utils::pkce::verify_pkce;
use crate::utils::secret::hash_oauth_token;

/// A resolved, grant-specific bundle of everything `TokenEndpoint` needs to
/// mint a response. See §9 "Dynamic dispatch on grant_type".
pub enum TokenParams {
    AuthorizationCode {
        code: AuthorizationCode,
    },
    RefreshToken {
        previous: RefreshToken,
        requested_scope: Vec<String>,
    },
    ClientCredentials {
        user: User,
        application: Application,
        scope: Vec<String>,
    },
    Password {
        user: User,
        application: Application,
        scope: Vec<String>,
    },
    JwtAssertion {
        user: User,
        application: Application,
        scope: Vec<String>,
    },
}

pub struct GrantValidator<'a> {
    pub code_store: &'a dyn CodeStore,
    pub refresh_store: &'a dyn RefreshTokenStore,
    pub user_store: &'a dyn UserStore,
    pub provider_store: &'a dyn ProviderStore,
    pub event_sink: &'a dyn EventSink,
    pub redirect_cache: &'a RedirectPatternCache,
    pub policy_gate: PolicyGate<'a>,
    pub jwt_verifier: JwtAssertionVerifier<'a>,
    pub now: DateTime<Utc>,
}

impl<'a> GrantValidator<'a> {
    pub async fn parse(&self, form: &TokenRequestForm, provider: &Provider) -> Result<TokenParams, TokenError> {
        match form.grant_type.as_str() {
            "authorization_code" => self.parse_authorization_code(form, provider).await,
            "refresh_token" => self.parse_refresh_token(form, provider).await,
            "client_credentials" => self.parse_client_credentials(form, provider).await,
            "password" => self.parse_password(form, provider).await,
            _ => Err(TokenError::UnsupportedGrantType),
        }
    }

    async fn parse_authorization_code(
        &self,
        form: &TokenRequestForm,
        provider: &Provider,
    ) -> Result<TokenParams, TokenError> {
        let raw_code = form
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TokenError::invalid_grant("missing code"))?;

        let code = self
            .code_store
            .find(raw_code, &provider.id)
            .await
            .map_err(|_| TokenError::invalid_grant("code lookup failed"))?
            .ok_or_else(|| TokenError::invalid_grant("unknown authorization code"))?;

        if code.is_expired(self.now) {
            return Err(TokenError::invalid_grant("authorization code expired"));
        }

        let redirect_uri = form.redirect_uri.as_deref().unwrap_or("").to_lowercase();
        self.validate_redirect_uri(provider, &redirect_uri).await?;

        if let Some(challenge) = &code.code_challenge {
            let verifier = form
                .code_verifier
                .as_deref()
                .ok_or_else(|| TokenError::invalid_grant("code_verifier required"))?;
            let method = code
                .code_challenge_method
                .map(|m| m.as_db())
                .unwrap_or("plain");
            if !verify_pkce(verifier, challenge, method) {
                return Err(TokenError::invalid_grant("code_verifier does not match code_challenge"));
            }
        }

        Ok(TokenParams::AuthorizationCode { code })
    }

    async fn validate_redirect_uri(&self, provider: &Provider, redirect_uri: &str) -> Result<(), TokenError> {
        // A malformed pattern is this provider's own misconfiguration, never
        // propagated as an internal error — surfaced as `invalid_client`
        // like an unknown client, with a configuration-error audit.
        let patterns = match self.redirect_cache.get_or_compile(provider) {
            Ok(patterns) => patterns,
            Err(e) => {
                self.event_sink
                    .emit(AuditEvent::configuration_error(provider.client_id.clone(), &e.to_string()))
                    .await;
                return Err(TokenError::invalid_client("provider redirect_uri configuration is invalid"));
            }
        };

        if patterns.is_empty() {
            return Err(TokenError::invalid_client("provider has no redirect_uri patterns"));
        }

        if patterns.iter().any(|re| full_match(re, redirect_uri)) {
            Ok(())
        } else {
            Err(TokenError::invalid_client("redirect_uri does not match provider configuration"))
        }
    }

    async fn parse_refresh_token(
        &self,
        form: &TokenRequestForm,
        provider: &Provider,
    ) -> Result<TokenParams, TokenError> {
        let raw_token = form
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TokenError::invalid_grant("missing refresh_token"))?;

        let previous = self
            .refresh_store
            .find_active(raw_token, &provider.id)
            .await
            .map_err(|_| TokenError::invalid_grant("refresh token lookup failed"))?
            .ok_or_else(|| TokenError::invalid_grant("unknown refresh token"))?;

        if previous.is_expired(self.now) {
            return Err(TokenError::invalid_grant("refresh token expired"));
        }

        if previous.revoked {
            self.event_sink
                .emit(AuditEvent::suspicious_request(
                    provider.client_id.clone(),
                    "revoked refresh token presented",
                ))
                .await;
            return Err(TokenError::invalid_grant("refresh token already revoked"));
        }

        let requested = form.scopes();
        let requested_scope = if requested.is_empty() { previous.scope.clone() } else { requested };

        Ok(TokenParams::RefreshToken { previous, requested_scope })
    }

    async fn parse_client_credentials(
        &self,
        form: &TokenRequestForm,
        provider: &Provider,
    ) -> Result<TokenParams, TokenError> {
        if let Some(assertion_type) = form.client_assertion_type.as_deref().filter(|t| !t.is_empty()) {
            let assertion = form
                .client_assertion
                .as_deref()
                .ok_or_else(|| TokenError::invalid_grant("missing client_assertion"))?;
            let scope = form.scopes();
            let outcome = self.jwt_verifier.verify(provider, assertion_type, assertion, &scope).await?;
            return Ok(TokenParams::JwtAssertion {
                user: outcome.user,
                application: outcome.application,
                scope,
            });
        }

        let (user, application, scope) = self.resolve_credentials_grant(form, provider, "client_credentials").await?;
        Ok(TokenParams::ClientCredentials { user, application, scope })
    }

    async fn parse_password(&self, form: &TokenRequestForm, provider: &Provider) -> Result<TokenParams, TokenError> {
        let (user, application, scope) = self.resolve_credentials_grant(form, provider, "password").await?;
        Ok(TokenParams::Password { user, application, scope })
    }

    /// Shared username/password + app-password authentication used by both
    /// `client_credentials` (non-JWT) and `password` (RFC 6749 §4.3).
    async fn resolve_credentials_grant(
        &self,
        form: &TokenRequestForm,
        provider: &Provider,
        grant_type: &str,
    ) -> Result<(User, Application, Vec<String>), TokenError> {
        let username = form
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| TokenError::invalid_grant("missing username"))?;
        let password = form
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TokenError::invalid_grant("missing password"))?;

        let user = self
            .user_store
            .find_by_username(username)
            .await
            .map_err(|_| TokenError::invalid_grant("user lookup failed"))?
            .ok_or_else(|| TokenError::invalid_grant("unknown username"))?;

        let app_password = self
            .user_store
            .find_app_password(&hash_oauth_token(password))
            .await
            .map_err(|_| TokenError::invalid_grant("app password lookup failed"))?
            .ok_or_else(|| TokenError::invalid_grant("unknown app password"))?;

        if app_password.is_expired(self.now) {
            return Err(TokenError::invalid_grant("app password expired"));
        }
        if app_password.user_uid != user.uid {
            return Err(TokenError::invalid_grant("app password does not belong to user"));
        }

        let application = self
            .provider_store
            .find_application(&provider.id)
            .await
            .map_err(|_| TokenError::invalid_grant("application lookup failed"))?
            .ok_or_else(|| TokenError::invalid_grant("no application bound to provider"))?;

        let scope = form.scopes();

        let mut extra = HashMap::new();
        if let Some(verifier) = &form.code_verifier {
            extra.insert("oauth_code_verifier".to_string(), serde_json::Value::String(verifier.clone()));
        }
        self.policy_gate.check(&application, &user, grant_type, &scope, extra).await?;

        self.event_sink
            .emit(AuditEvent::login(provider.client_id.clone(), user.uid.clone(), "token"))
            .await;

        Ok((user, application, scope))
    }
}

/// Whether `re` matches `s` in its entirety, not merely a substring — the
/// provider's own pattern is expected to anchor with `^`/`$`, but this does
/// not rely on that being the case.
fn full_match(re: &Regex, s: &str) -> bool {
    re.find(s).map(|m| m.start() == 0 && m.end() == s.len()).unwrap_or(false)
}

use axum::extract::{Query, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::config::AppState;
use crate::dto::token::TokenRequestForm;
use crate::services::TokenEndpointDeps;
use crate::stores::policy_engine::AllowAllPolicyEngine;
use crate::stores::{
    code_store::MySqlCodeStore, event_sink::MySqlEventSink, provider_store::MySqlProviderStore,
    refresh_store::MySqlRefreshTokenStore, user_store::MySqlUserStore, ProviderStore,
};

/// `POST {endpoint}` — §4.6.1.
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenRequestForm>,
) -> Response {
    let provider_store = MySqlProviderStore::new(state.pool.clone());
    let code_store = MySqlCodeStore::new(state.pool.clone());
    let refresh_store = MySqlRefreshTokenStore::new(state.pool.clone());
    let user_store = MySqlUserStore::new(state.pool.clone());
    let event_sink = MySqlEventSink::new(state.pool.clone());
    let policy_engine = AllowAllPolicyEngine;

    let authorization_header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    let deps = TokenEndpointDeps {
        provider_store: &provider_store,
        code_store: &code_store,
        refresh_store: &refresh_store,
        user_store: &user_store,
        policy_engine: &policy_engine,
        event_sink: &event_sink,
        redirect_cache: &state.redirect_cache,
        key_cache: &state.key_cache,
        http_client: &state.http_client,
        jwks_cache: &state.jwks_cache,
        jwks_ttl_secs: state.config.jwks_cache_ttl_secs,
        issuer: &state.config.issuer,
        default_token_validity: &state.config.default_token_validity,
        now: Utc::now(),
    };

    match deps.handle(&form, authorization_header).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(failure) => failure.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct OptionsQuery {
    /// The actual preflight request carries no form body, so the provider
    /// whose origins are mirrored must be named in the query string. A
    /// caller that omits it gets a response with no CORS headers at all —
    /// the safe default of allowing nothing, per testable property S7.
    client_id: Option<String>,
}

/// `OPTIONS {endpoint}` — §4.6.2. Mirrors the requesting `Origin` back only
/// when it matches one of the resolved provider's configured redirect
/// origins; every other origin is refused silently (no CORS headers set).
pub async fn token_options_handler(
    State(state): State<AppState>,
    Query(params): Query<OptionsQuery>,
    headers: HeaderMap,
) -> Response {
    let mut response = (StatusCode::OK, Json(serde_json::json!({}))).into_response();

    let Some(client_id) = params.client_id else {
        return response;
    };

    let provider_store = MySqlProviderStore::new(state.pool.clone());
    let Ok(Some(provider)) = provider_store.find_by_client_id(&client_id).await else {
        return response;
    };

    let origins: Vec<String> = provider
        .redirect_uri_patterns()
        .filter_map(origin_from_pattern)
        .collect();

    let Some(request_origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return response;
    };

    if origins.iter().any(|o| o == request_origin) {
        if let Ok(value) = HeaderValue::from_str(request_origin) {
            let resp_headers = response.headers_mut();
            resp_headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            resp_headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST"));
            resp_headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("authorization, content-type"),
            );
        }
    }

    response
}

/// Recovers a redirect origin (`scheme://host[:port]`) from one of a
/// provider's anchored regex patterns, e.g. `^https://app\.example/cb$` →
/// `https://app.example`. Patterns that don't parse as a URL-shaped prefix
/// are skipped rather than erroring — CORS mirroring degrades to allowing
/// fewer origins, never more.
fn origin_from_pattern(pattern: &str) -> Option<String> {
    let cleaned = pattern.trim_start_matches('^').trim_end_matches('$');
    let unescaped = unescape_regex_literal(cleaned);

    let scheme_end = unescaped.find("://")?;
    let after_scheme = &unescaped[scheme_end + 3..];
    let host_end = after_scheme.find('/').unwrap_or(after_scheme.len());

    Some(format!("{}://{}", &unescaped[..scheme_end], &after_scheme[..host_end]))
}

fn unescape_regex_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

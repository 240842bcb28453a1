use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{Application, User};

/// Context passed to the policy gate: scopes requested, grant type, and
/// grant-specific extras (`oauth_code_verifier`, `oauth_jwt`, ...).
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub scopes: Vec<String>,
    pub grant_type: String,
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub passing: bool,
    pub reasons: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        PolicyDecision {
            passing: true,
            reasons: vec![],
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision {
            passing: false,
            reasons: vec![reason.into()],
        }
    }
}

/// External rule engine deciding whether a `(user, application, context)`
/// tuple may obtain a token. The core never inspects the rules themselves.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, application: &Application, user: &User, ctx: &PolicyContext) -> PolicyDecision;
}

/// Shipped stand-in so the server runs end to end: allows every request.
/// A real deployment swaps this for a rule engine behind the same trait.
pub struct AllowAllPolicyEngine;

#[async_trait]
impl PolicyEngine for AllowAllPolicyEngine {
    async fn evaluate(&self, _application: &Application, _user: &User, _ctx: &PolicyContext) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

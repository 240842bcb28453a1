//! Thin wrapper around a `PolicyEngine` (§4.4): builds the standard context
//! and converts a denial into `invalid_grant`.

use std::collections::HashMap;

use crate::error::TokenError;
use crate::models::{Application, User};
use crate::stores::{PolicyContext, PolicyDecision, PolicyEngine};

pub struct PolicyGate<'a> {
    pub engine: &'a dyn PolicyEngine,
}

impl<'a> PolicyGate<'a> {
    /// `extra` carries grant-specific context keys such as `oauth_code_verifier`.
    pub async fn check(
        &self,
        application: &Application,
        user: &User,
        grant_type: &str,
        scopes: &[String],
        extra: HashMap<String, serde_json::Value>,
    ) -> Result<(), TokenError> {
        let ctx = PolicyContext {
            scopes: scopes.to_vec(),
            grant_type: grant_type.to_string(),
            extra,
        };

        let PolicyDecision { passing, reasons } = self.engine.evaluate(application, user, &ctx).await;
        if passing {
            Ok(())
        } else {
            Err(TokenError::invalid_grant(reasons.join("; ")))
        }
    }
}

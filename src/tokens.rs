//! Bearer token registry
//!
//! Tokens arrive from the environment (a JSON table plus the dedicated
//! metrics token) and are matched after normalization. Authenticated
//! requests carry an `Actor` with a short fingerprint for log correlation;
//! never the token itself.

use std::collections::HashMap;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::AppConfig;

/// One configured token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenDefinition {
    pub token: String,
    pub role: String,
    #[serde(default)]
    pub metrics_only: bool,
}

/// Authenticated principal attached to the request
#[derive(Debug, Clone)]
pub struct Actor {
    pub role: String,
    pub metrics_only: bool,
    pub token_fingerprint: String,
}

/// Authentication failure with a stable reason label
#[derive(Debug, Clone)]
pub struct AuthorizationError {
    pub reason: &'static str,
    pub message_fa: &'static str,
}

impl AuthorizationError {
    fn missing() -> Self {
        Self {
            reason: "missing_token",
            message_fa: "توکن الزامی است.",
        }
    }

    fn unknown() -> Self {
        Self {
            reason: "unknown_token",
            message_fa: "توکن نامعتبر است.",
        }
    }

    fn scope_denied() -> Self {
        Self {
            reason: "scope_denied",
            message_fa: "دسترسی برای این توکن مجاز نیست.",
        }
    }
}

fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}

/// Lookup table for bearer and metrics tokens
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: HashMap<String, TokenDefinition>,
}

impl TokenRegistry {
    pub fn new(definitions: Vec<TokenDefinition>) -> Self {
        let tokens = definitions
            .into_iter()
            .filter(|definition| !definition.token.is_empty())
            .map(|definition| (definition.token.clone(), definition))
            .collect();
        Self { tokens }
    }

    /// Build from the configured environment variables: a JSON token table
    /// plus the dedicated metrics token.
    pub fn from_env(config: &AppConfig) -> Self {
        let mut definitions: Vec<TokenDefinition> = Vec::new();
        let table = config.secret_from_env(&config.auth.tokens_env);
        if !table.is_empty() {
            if let Ok(parsed) = serde_json::from_str::<Vec<TokenDefinition>>(&table) {
                definitions.extend(parsed);
            }
        }
        let metrics_token = config.secret_from_env(&config.auth.metrics_token_env);
        if !metrics_token.is_empty() {
            definitions.push(TokenDefinition {
                token: metrics_token,
                role: "metrics".to_string(),
                metrics_only: true,
            });
        }
        Self::new(definitions)
    }

    /// Authenticate a normalized token.
    ///
    /// `allow_metrics` widens the check for `/metrics`, where a
    /// metrics-only token is sufficient.
    pub fn authenticate(
        &self,
        token: &str,
        allow_metrics: bool,
    ) -> Result<Actor, AuthorizationError> {
        if token.is_empty() {
            return Err(AuthorizationError::missing());
        }
        let definition = self
            .tokens
            .get(token)
            .ok_or_else(AuthorizationError::unknown)?;
        if definition.metrics_only && !allow_metrics {
            return Err(AuthorizationError::scope_denied());
        }
        Ok(Actor {
            role: definition.role.clone(),
            metrics_only: definition.metrics_only,
            token_fingerprint: fingerprint(token),
        })
    }
}

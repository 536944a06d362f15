//! Operator API key authentication.
//!
//! Keys are configured as SHA-256 hex digests mapped to a user id. The
//! bearer token from each request is hashed and looked up; the matching
//! operator is injected as a request extension for downstream handlers.

use std::collections::HashMap;

use anyhow::{bail, Result};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::{error::create_error_response, state::AppState};

/// Authenticated operator, available to handlers as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Id recorded on ignore and replay actions.
    pub user_id: String,
}

/// Accepted operator keys, indexed by SHA-256 hex digest.
#[derive(Debug, Clone, Default)]
pub struct OperatorKeys {
    by_hash: HashMap<String, String>,
}

impl OperatorKeys {
    /// Parses a comma-separated list of `user_id:sha256hex` pairs.
    ///
    /// # Errors
    ///
    /// Fails on an entry without a user id or with a digest that is not
    /// 64 hex characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut keys = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((user_id, digest)) = entry.split_once(':') else {
                bail!("operator key entry must be user_id:sha256hex");
            };
            let (user_id, digest) = (user_id.trim(), digest.trim());
            if user_id.is_empty() {
                bail!("operator key entry is missing a user id");
            }
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("operator key for {user_id} is not a sha256 hex digest");
            }
            keys.by_hash.insert(digest.to_ascii_lowercase(), user_id.to_string());
        }
        Ok(keys)
    }

    /// Registers a plaintext key for `user_id`.
    #[must_use]
    pub fn with_key(mut self, user_id: impl Into<String>, api_key: &str) -> Self {
        self.by_hash.insert(sha256::digest(api_key.as_bytes()), user_id.into());
        self
    }

    /// Resolves a plaintext key to its operator.
    pub fn authenticate(&self, api_key: &str) -> Option<Operator> {
        let key_hash = sha256::digest(api_key.as_bytes());
        self.by_hash.get(&key_hash).map(|user_id| Operator { user_id: user_id.clone() })
    }

    /// Number of configured keys.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether no keys are configured.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

/// Extracts API key from Authorization header.
/// Supports Bearer token format: "Bearer <api-key>"
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Errors that can occur during operator authentication.
#[derive(Debug)]
pub enum AuthError {
    /// The key does not match any configured operator.
    InvalidApiKey,
    /// The Authorization header is missing or not a bearer token.
    MissingHeader,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::InvalidApiKey => "Invalid API key",
            Self::MissingHeader => "Missing Authorization header",
        };

        create_error_response(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }
}

/// Axum middleware that authenticates operator requests.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let api_key = extract_api_key(req.headers()).ok_or_else(|| {
        debug!(path = %req.uri().path(), "Operator request without bearer token");
        AuthError::MissingHeader
    })?;

    let operator = state.operators.authenticate(api_key).ok_or_else(|| {
        warn!(path = %req.uri().path(), "Operator request with unknown API key");
        AuthError::InvalidApiKey
    })?;

    req.extensions_mut().insert(operator);

    Ok(next.run(req).await)
}

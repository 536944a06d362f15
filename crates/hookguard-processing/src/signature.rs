//! HMAC-SHA256 verification of inbound deliveries.
//!
//! The digest is computed over the exact bytes received, before any JSON
//! parsing. Accepted header formats:
//! - `sha256=<hex>`
//! - `v1=<hex>`
//! - bare `<hex>`
//!
//! Rotation: one active secret, plus an optional previous secret that keeps
//! verifying until a fixed instant. The computed value stored for audit is
//! always the active-secret digest.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Longest header value kept for audit; longer values are cut.
pub const MAX_STORED_SIGNATURE_LEN: usize = 512;

/// Which configured secret produced a matching signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedKey {
    /// The active secret.
    Active,
    /// The previous secret, inside its grace window.
    Previous,
}

/// Outcome of verifying one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    /// Whether any accepted secret matched.
    pub valid: bool,
    /// Header value as supplied, trimmed and capped at
    /// [`MAX_STORED_SIGNATURE_LEN`] characters; empty when absent.
    pub provided: String,
    /// Lowercase hex digest under the active secret.
    pub computed: String,
    /// Secret that matched, when valid.
    pub matched_key: Option<MatchedKey>,
}

/// A retired secret that is still honored for a while.
#[derive(Clone)]
pub struct PreviousSecret {
    secret: String,
    valid_until: DateTime<Utc>,
}

impl PreviousSecret {
    /// Creates a previous secret accepted strictly before `valid_until`.
    pub fn new(secret: impl Into<String>, valid_until: DateTime<Utc>) -> Self {
        Self { secret: secret.into(), valid_until }
    }
}

impl fmt::Debug for PreviousSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviousSecret")
            .field("secret", &"<redacted>")
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

/// Verifies delivery signatures against the configured secrets.
#[derive(Clone)]
pub struct SignatureVerifier {
    active: String,
    previous: Option<PreviousSecret>,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("active", &"<redacted>")
            .field("previous", &self.previous)
            .finish()
    }
}

impl SignatureVerifier {
    /// Creates a verifier with only an active secret.
    pub fn new(active: impl Into<String>) -> Self {
        Self { active: active.into(), previous: None }
    }

    /// Adds a previous secret honored until its expiry.
    #[must_use]
    pub fn with_previous(mut self, previous: PreviousSecret) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Verifies `payload` against the header value, if any.
    ///
    /// Never fails: a missing or malformed header is simply invalid.
    pub fn verify(&self, payload: &[u8], header: Option<&str>, now: DateTime<Utc>) -> SignatureCheck {
        let active_digest = hmac_sha256(payload, &self.active);
        let computed = hex::encode(active_digest);
        let header = header.unwrap_or_default().trim();
        let provided: String = header.chars().take(MAX_STORED_SIGNATURE_LEN).collect();

        let Some(candidate) = parse_signature_header(header) else {
            return SignatureCheck { valid: false, provided, computed, matched_key: None };
        };

        let matched_key = if digest_matches(&candidate, &active_digest) {
            Some(MatchedKey::Active)
        } else {
            self.previous
                .as_ref()
                .filter(|previous| now < previous.valid_until)
                .filter(|previous| {
                    digest_matches(&candidate, &hmac_sha256(payload, &previous.secret))
                })
                .map(|_| MatchedKey::Previous)
        };

        SignatureCheck { valid: matched_key.is_some(), provided, computed, matched_key }
    }
}

/// Computes the `sha256=<hex>` header value a sender would attach.
pub fn sign(payload: &[u8], secret: &str) -> String {
    format!("sha256={}", hex::encode(hmac_sha256(payload, secret)))
}

pub(crate) fn hmac_sha256(payload: &[u8], secret: &str) -> [u8; 32] {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return [0; 32],
    };
    mac.update(payload);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    digest
}

fn digest_matches(candidate: &[u8], expected: &[u8; 32]) -> bool {
    candidate.len() == expected.len() && bool::from(candidate.ct_eq(expected))
}

/// Extracts the raw digest bytes from a header value.
fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_part = header
        .strip_prefix("sha256=")
        .or_else(|| header.strip_prefix("v1="))
        .unwrap_or(header);

    if hex_part.len() != 64 {
        return None;
    }
    hex::decode(hex_part.to_ascii_lowercase()).ok()
}

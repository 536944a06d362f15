//! Short-lived tokens confirming a force replay.
//!
//! A token is `"{expires_unix}.{hex}"` where the hex part is an HMAC over the
//! event id, the event's replay count at issue time, and the expiry. Tokens
//! need no server-side state: any instance sharing the secret can check
//! them, and they cannot be moved to another event. Every executed replay
//! bumps the replay count, which spends every token issued before it.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hookguard_core::EventId;
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::signature::hmac_sha256;

/// A freshly issued confirmation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationToken {
    /// Value the operator sends back.
    pub token: String,
    /// Instant after which the token is rejected.
    pub expires_at: DateTime<Utc>,
}

/// Issues and checks force-replay confirmation tokens.
#[derive(Clone)]
pub struct ConfirmationTokens {
    secret: String,
    ttl: Duration,
}

impl std::fmt::Debug for ConfirmationTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationTokens").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl ConfirmationTokens {
    /// Creates a token issuer.
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self { secret: secret.into(), ttl }
    }

    /// Issues a token for `event_id` at replay count `retry_count`, valid for
    /// the configured TTL.
    pub fn issue(
        &self,
        event_id: &EventId,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> ConfirmationToken {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5));
        let expires_at = now + ttl;
        let expires_unix = expires_at.timestamp();
        let mac = self.mac(event_id, retry_count, expires_unix);
        let token = format!("{expires_unix}.{}", hex::encode(mac));
        // Round down so the reported expiry matches what the token encodes.
        let expires_at = Utc.timestamp_opt(expires_unix, 0).single().unwrap_or(expires_at);
        ConfirmationToken { token, expires_at }
    }

    /// Returns whether `token` confirms `event_id` at replay count
    /// `retry_count` at `now`.
    pub fn verify(
        &self,
        event_id: &EventId,
        retry_count: i32,
        token: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some((expires, digest)) = token.trim().split_once('.') else {
            return false;
        };
        let Ok(expires_unix) = expires.parse::<i64>() else {
            return false;
        };
        if now.timestamp() >= expires_unix {
            return false;
        }
        let Ok(provided) = hex::decode(digest) else {
            return false;
        };
        let expected = self.mac(event_id, retry_count, expires_unix);
        provided.len() == expected.len() && bool::from(provided.ct_eq(&expected))
    }

    fn mac(&self, event_id: &EventId, retry_count: i32, expires_unix: i64) -> [u8; 32] {
        let message = format!("force-replay:{event_id}:{retry_count}:{expires_unix}");
        hmac_sha256(message.as_bytes(), &self.secret)
    }
}

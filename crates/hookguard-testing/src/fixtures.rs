//! Payload builders and signing helpers.

use hookguard_processing::signature;
use serde_json::{json, Map, Value};

use crate::TEST_SIGNING_SECRET;

/// Builder for bot delivery payloads.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    event_id: Option<String>,
    event_type: Option<String>,
    version: Option<Value>,
    data: Map<String, Value>,
}

impl PayloadBuilder {
    /// Starts a payload with the given envelope.
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: Some(event_id.into()),
            event_type: Some(event_type.into()),
            version: None,
            data: Map::new(),
        }
    }

    /// `quote_accepted` for a purchase.
    pub fn quote_accepted(event_id: impl Into<String>, purchase_id: &str) -> Self {
        Self::new(event_id, "quote_accepted").data("purchase_id", purchase_id)
    }

    /// `repair_requested` with a description.
    pub fn repair_requested(event_id: impl Into<String>, description: &str) -> Self {
        Self::new(event_id, "repair_requested").data("description", description)
    }

    /// Sets an explicit version.
    #[must_use]
    pub fn version(mut self, version: impl Into<Value>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Adds a field under `data`.
    #[must_use]
    pub fn data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Drops `event_id` from the envelope.
    #[must_use]
    pub fn without_event_id(mut self) -> Self {
        self.event_id = None;
        self
    }

    /// Drops `event_type` from the envelope.
    #[must_use]
    pub fn without_event_type(mut self) -> Self {
        self.event_type = None;
        self
    }

    /// Builds the JSON document.
    pub fn build(self) -> Value {
        let mut payload = Map::new();
        if let Some(event_id) = self.event_id {
            payload.insert("event_id".to_string(), json!(event_id));
        }
        if let Some(event_type) = self.event_type {
            payload.insert("event_type".to_string(), json!(event_type));
        }
        if let Some(version) = self.version {
            payload.insert("version".to_string(), version);
        }
        payload.insert("data".to_string(), Value::Object(self.data));
        Value::Object(payload)
    }

    /// Serialized body bytes.
    pub fn body(self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}

/// Signs `body` with the test secret, as the bot would.
pub fn sign(body: &[u8]) -> String {
    signature::sign(body, TEST_SIGNING_SECRET)
}

/// Signs `body` with an arbitrary secret.
pub fn sign_with(body: &[u8], secret: &str) -> String {
    signature::sign(body, secret)
}

/// Returns a copy of `body` with one byte flipped.
pub fn tamper(body: &[u8]) -> Vec<u8> {
    let mut tampered = body.to_vec();
    if let Some(byte) = tampered.iter_mut().rev().find(|b| b.is_ascii_alphanumeric()) {
        *byte = if *byte == b'x' { b'y' } else { b'x' };
    }
    tampered
}

//! JSON gateway message shapes.
//!
//! The gateway encodes bytes as base64 and int64 fields as strings, and omits
//! fields holding their zero value.

use base64::{Engine as _, engine::general_purpose};
use leasehold_store::{EventKind, KeyValue, LeaseId, Revision, StoreError, StoreResult, WatchEvent};
use serde::Deserialize;
use serde_json::{Value, json};

pub(crate) fn encode(raw: &str) -> String {
    general_purpose::STANDARD.encode(raw.as_bytes())
}

pub(crate) fn decode(encoded: &str) -> StoreResult<String> {
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::InvalidResponse(format!("bad base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

pub(crate) mod int64 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(i64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(D::Error::custom),
            Repr::Number(n) => Ok(n),
        }
    }
}

/// Error body returned with non-2xx responses and inside stream frames.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct GatewayStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: String,
}

impl GatewayStatus {
    pub fn text(&self) -> &str {
        if self.message.is_empty() { &self.error } else { &self.message }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResponseHeader {
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub revision: Revision,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawKeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub create_revision: Revision,
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub mod_revision: Revision,
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub lease: i64,
}

impl RawKeyValue {
    pub fn into_key_value(self) -> StoreResult<KeyValue> {
        Ok(KeyValue {
            key: decode(&self.key)?,
            value: decode(&self.value)?,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: (self.lease != 0).then(|| LeaseId::new(self.lease)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "int64::deserialize")]
    pub id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "int64::deserialize")]
    pub ttl: i64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "int64::deserialize")]
    pub ttl: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeepAliveFrame {
    pub result: Option<KeepAliveResult>,
    pub error: Option<GatewayStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<RawKeyValue>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResponseOp {
    pub response_range: Option<RangeResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TxnResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    pub responses: Vec<ResponseOp>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEvent {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub kv: Option<RawKeyValue>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WatchResult {
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub cancel_reason: String,
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub compact_revision: Revision,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WatchFrame {
    pub result: Option<WatchResult>,
    pub error: Option<GatewayStatus>,
}

impl RawEvent {
    pub fn into_event(self) -> StoreResult<WatchEvent> {
        let kv = self
            .kv
            .ok_or_else(|| StoreError::InvalidResponse("watch event without kv".to_string()))?;
        let kind = match self.kind.as_deref() {
            Some("DELETE") => EventKind::Delete,
            _ => EventKind::Put,
        };
        let lease = (kind == EventKind::Put && kv.lease != 0).then(|| LeaseId::new(kv.lease));

        Ok(WatchEvent {
            kind,
            key: decode(&kv.key)?,
            revision: kv.mod_revision,
            lease,
        })
    }
}

pub(crate) fn create_if_absent_txn(key: &str, value: &str, lease: LeaseId) -> Value {
    let key = encode(key);
    json!({
        "compare": [{
            "key": key,
            "result": "EQUAL",
            "target": "CREATE",
            "create_revision": "0",
        }],
        "success": [{
            "request_put": {
                "key": key,
                "value": encode(value),
                "lease": lease.get().to_string(),
            }
        }],
        "failure": [{
            "request_range": { "key": key }
        }],
    })
}

pub(crate) fn delete_if_owned_txn(key: &str, lease: LeaseId) -> Value {
    let key = encode(key);
    json!({
        "compare": [{
            "key": key,
            "result": "EQUAL",
            "target": "LEASE",
            "lease": lease.get().to_string(),
        }],
        "success": [{
            "request_delete_range": { "key": key }
        }],
    })
}

pub(crate) fn watch_request(key: &str, from_revision: Revision) -> Value {
    json!({
        "create_request": {
            "key": encode(key),
            "start_revision": from_revision.to_string(),
        }
    })
}

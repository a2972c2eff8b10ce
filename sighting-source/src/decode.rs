use core_types::{BeaconId, BeaconKind, GatewayAddress, Observation, SightingReport};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::topic::TopicPattern;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a json array of observations, got {0}")]
    NotAnArray(&'static str),
    #[error("topic '{0}' does not match the subscription pattern")]
    UnexpectedTopic(String),
}

/// Broker frame carrying one publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
}

/// Control frame sent to the broker after every (re)connect.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeFrame<'a> {
    pub action: &'static str,
    pub topic: &'a str,
}

impl<'a> SubscribeFrame<'a> {
    pub fn new(topic: &'a str) -> Self {
        Self {
            action: "subscribe",
            topic,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    mac: Option<String>,
    #[serde(default)]
    rssi: Option<i32>,
}

impl From<WireObservation> for Observation {
    fn from(wire: WireObservation) -> Self {
        Observation {
            kind: BeaconKind::from_wire(&wire.kind),
            beacon: BeaconId::new(wire.mac.as_deref().unwrap_or_default()),
            rssi: wire.rssi,
        }
    }
}

/// Decodes a gateway payload: a JSON array of `{"type", "mac", "rssi", ...}` objects. Items that
/// do not fit that shape are logged and skipped; the rest of the report is kept.
pub fn decode_payload(gateway: GatewayAddress, payload: &Value) -> Result<SightingReport, DecodeError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::String(raw) => {
            let nested: Value = serde_json::from_str(raw)?;
            return match nested {
                Value::String(_) => Err(DecodeError::NotAnArray("string")),
                other => decode_payload(gateway, &other),
            };
        }
        other => return Err(DecodeError::NotAnArray(kind_name(other))),
    };
    let observations = items
        .iter()
        .filter_map(|item| match WireObservation::deserialize(item) {
            Ok(wire) => Some(Observation::from(wire)),
            Err(err) => {
                warn!("[decode] skipping malformed observation from {gateway}: {err}");
                None
            }
        })
        .collect();
    Ok(SightingReport::new(gateway, observations))
}

/// Decodes a whole broker frame, taking the gateway address from the topic.
pub fn decode_frame(pattern: &TopicPattern, text: &str) -> Result<SightingReport, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let gateway = pattern
        .gateway_from(&envelope.topic)
        .ok_or_else(|| DecodeError::UnexpectedTopic(envelope.topic.clone()))?;
    decode_payload(gateway, &envelope.payload)
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

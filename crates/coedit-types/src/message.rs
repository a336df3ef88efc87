//! WebSocket wire protocol envelope
//!
//! Every JSON frame carries at least `{type, docId}`; all remaining fields
//! are kept in a flattened payload map so frames can be rebroadcast verbatim.
//! Binary frames are raw CRDT update bytes and are equivalent to
//! `{type: "update", bytes: [...]}`.
//!
//! Message Format:
//! ```json
//! {
//!   "type": "update",
//!   "docId": "doc-A",
//!   "bytes": [1, 2, 3],
//!   "senderId": "client-4-xyz"
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::prelude::*;
use crate::types::Timestamp;

// Message type constants (matching the editor client implementation)
pub const MSG_WELCOME: &str = "welcome";
pub const MSG_SNAPSHOT: &str = "snapshot";
pub const MSG_QUERY_SNAPSHOT: &str = "query-snapshot";
pub const MSG_UPDATE: &str = "update";
pub const MSG_EPHEMERAL: &str = "ephemeral";
pub const MSG_QUERY_EPHEMERAL: &str = "query-ephemeral";
pub const MSG_CURSOR_POSITION: &str = "cursor-position";
pub const MSG_TEXT_SELECTION: &str = "text-selection";
pub const MSG_AWARENESS_UPDATE: &str = "awareness-update";
pub const MSG_APPEND_PARAGRAPH: &str = "append-paragraph";
pub const MSG_INSERT_PARAGRAPH: &str = "insert-paragraph";
pub const MSG_KEEPALIVE: &str = "keepalive";
pub const MSG_KEEPALIVE_ACK: &str = "keepalive-ack";
pub const MSG_PING: &str = "ping";
pub const MSG_ERROR: &str = "error";

/// A message in the collaboration protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
	/// Message type (update, snapshot, ephemeral, etc.)
	#[serde(rename = "type")]
	pub msg_type: String,

	/// Target document id
	#[serde(rename = "docId", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,

	/// All other fields (bytes, senderId, text, index, etc.) flattened into this map
	#[serde(flatten)]
	pub payload: serde_json::Map<String, Value>,
}

impl WireMessage {
	/// Create a new message with the payload fields of a JSON object
	pub fn new(msg_type: impl Into<String>, doc_id: impl Into<String>, payload: Value) -> Self {
		let mut map = serde_json::Map::new();
		if let Value::Object(obj) = payload {
			map = obj;
		}
		Self { msg_type: msg_type.into(), doc_id: doc_id.into(), payload: map }
	}

	/// Welcome frame sent once after accept
	pub fn welcome(doc_id: &str, client_id: &str, color: &str) -> Self {
		Self::new(MSG_WELCOME, doc_id, json!({ "clientId": client_id, "color": color }))
	}

	/// Full-state snapshot frame
	pub fn snapshot(doc_id: &str, bytes: &[u8]) -> Self {
		Self::new(MSG_SNAPSHOT, doc_id, json!({ "bytes": bytes_to_value(bytes) }))
	}

	/// Incremental update frame
	pub fn update(doc_id: &str, bytes: &[u8], sender_id: Option<&str>) -> Self {
		let mut msg = Self::new(MSG_UPDATE, doc_id, json!({ "bytes": bytes_to_value(bytes) }));
		if let Some(sender_id) = sender_id {
			msg.payload.insert("senderId".to_string(), Value::String(sender_id.to_string()));
		}
		msg
	}

	/// Encoded ephemeral-store frame
	pub fn ephemeral(doc_id: &str, bytes: &[u8], sender_id: Option<&str>) -> Self {
		let mut msg = Self::new(MSG_EPHEMERAL, doc_id, json!({ "bytes": bytes_to_value(bytes) }));
		if let Some(sender_id) = sender_id {
			msg.payload.insert("senderId".to_string(), Value::String(sender_id.to_string()));
		}
		msg
	}

	/// Keepalive acknowledgement, echoing the optional ping id
	pub fn keepalive_ack(doc_id: &str, ping_id: Option<&Value>) -> Self {
		let mut msg =
			Self::new(MSG_KEEPALIVE_ACK, doc_id, json!({ "serverTs": Timestamp::now().0 }));
		if let Some(ping_id) = ping_id {
			msg.payload.insert("pingId".to_string(), ping_id.clone());
		}
		msg
	}

	/// Error frame; never tears down the connection
	pub fn error(doc_id: &str, reason: &str) -> Self {
		Self::new(MSG_ERROR, doc_id, json!({ "reason": reason }))
	}

	/// Fetch the raw CRDT bytes carried in the `bytes` payload field
	pub fn bytes(&self) -> CoResult<Vec<u8>> {
		let value = self
			.payload
			.get("bytes")
			.ok_or_else(|| Error::MalformedFrame("missing 'bytes' field".into()))?;
		bytes_from_value(value)
	}

	/// Serialize to a JSON string for the socket
	pub fn to_json(&self) -> CoResult<String> {
		Ok(serde_json::to_string(self)?)
	}

	/// Parse a text frame
	pub fn from_json(text: &str) -> CoResult<Self> {
		serde_json::from_str(text).map_err(|e| Error::MalformedFrame(e.to_string()))
	}
}

/// Encode bytes as a JSON array of numbers, the shape the editor client sends
pub fn bytes_to_value(bytes: &[u8]) -> Value {
	Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect())
}

/// Decode a JSON array of numbers back into bytes
pub fn bytes_from_value(value: &Value) -> CoResult<Vec<u8>> {
	let Value::Array(items) = value else {
		return Err(Error::MalformedFrame("'bytes' is not an array".into()));
	};
	items
		.iter()
		.map(|item| {
			item.as_u64()
				.and_then(|n| u8::try_from(n).ok())
				.ok_or_else(|| Error::MalformedFrame("'bytes' contains a non-byte value".into()))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_envelope_roundtrip() {
		let msg = WireMessage::update("doc-A", &[1, 2, 255], Some("client-1-x"));
		let text = msg.to_json().unwrap();
		let parsed = WireMessage::from_json(&text).unwrap();

		assert_eq!(parsed.msg_type, MSG_UPDATE);
		assert_eq!(parsed.doc_id, "doc-A");
		assert_eq!(parsed.bytes().unwrap(), vec![1, 2, 255]);
		assert_eq!(parsed.payload.get("senderId").and_then(Value::as_str), Some("client-1-x"));
	}

	#[test]
	fn test_unknown_fields_survive_rebroadcast() {
		let parsed = WireMessage::from_json(
			r#"{"type":"cursor-position","docId":"doc-B","position":12,"custom":"x"}"#,
		)
		.unwrap();
		assert_eq!(parsed.msg_type, MSG_CURSOR_POSITION);

		let reencoded: Value = serde_json::from_str(&parsed.to_json().unwrap()).unwrap();
		assert_eq!(reencoded["position"], 12);
		assert_eq!(reencoded["custom"], "x");
	}

	#[test]
	fn test_bytes_rejects_non_byte_values() {
		let msg = WireMessage::new("update", "doc-C", serde_json::json!({ "bytes": [1, 300] }));
		assert!(matches!(msg.bytes(), Err(Error::MalformedFrame(_))));
	}

	#[test]
	fn test_keepalive_ack_echoes_ping_id() {
		let ping_id = Value::String("ping-7".into());
		let msg = WireMessage::keepalive_ack("doc-D", Some(&ping_id));
		assert_eq!(msg.msg_type, MSG_KEEPALIVE_ACK);
		assert_eq!(msg.payload.get("pingId"), Some(&ping_id));
		assert!(msg.payload.get("serverTs").is_some());
	}

	#[test]
	fn test_malformed_frame_error() {
		assert!(matches!(WireMessage::from_json("{not json"), Err(Error::MalformedFrame(_))));
	}
}

// vim: ts=4

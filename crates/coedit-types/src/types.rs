//! Core shared types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unix timestamp in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Self {
		Timestamp(chrono::Utc::now().timestamp())
	}
}

/// Server-assigned client identifier (monotonic suffix + random salt)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Box<str>);

impl ClientId {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for ClientId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for ClientId {
	fn from(s: &str) -> Self {
		ClientId(s.into())
	}
}

/// Summary of a document's current state, used by the RPC
/// `get_document_info` verb and the hub's stats task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
	pub doc_id: String,
	/// Number of top-level blocks under the root
	pub total_blocks: usize,
	/// Node count per element type over the whole tree
	pub block_types: BTreeMap<String, usize>,
	/// Loro container id of the lexical tree
	pub container_id: String,
	/// Structural mutations applied through this model instance
	pub modification_count: u64,
	/// Number of changes in the CRDT oplog
	pub version: u64,
	pub initialized: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_saved: Option<Timestamp>,
}

/// JSON error body returned by the RPC interface
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
	pub code: String,
	pub message: String,
}

impl ErrorResponse {
	pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { error: ErrorDetail { code: code.into(), message: message.into() } }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_client_id_display() {
		let id = ClientId::from("client-1-abc");
		assert_eq!(id.to_string(), "client-1-abc");
		assert_eq!(id.as_str(), "client-1-abc");
	}

	#[test]
	fn test_error_response_shape() {
		let resp = ErrorResponse::new("E-DOC-NOTFOUND", "Document not found");
		let json = serde_json::to_value(&resp).unwrap();
		assert_eq!(json["error"]["code"], "E-DOC-NOTFOUND");
	}
}

// vim: ts=4

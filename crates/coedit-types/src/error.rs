//! Error handling subsystem. Implements a custom Error type.

use axum::{Json, http::StatusCode, response::IntoResponse};

use crate::prelude::*;
use crate::types::ErrorResponse;

pub type CoResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	// Input validation and constraints
	InvalidInput(String),     // 400 - malformed Lexical state or block data
	UnknownParent(String),    // 404 - parent lexical key not mapped
	UnknownNode(String),      // 404 - lexical key not mapped
	RootProtected,            // 409 - attempted to delete the document root
	DuplicateMapping(String), // 409 - key or tree id already bound
	NoCurrentDocument,        // 400 - no doc_id given and no current document set

	// Model state
	Uninitialized,      // model has no content yet
	AlreadyInitialized, // initialize called twice
	ModelPoisoned,      // CRDT layer panicked; model tainted until reload

	// Wire protocol
	MalformedFrame(String), // unparsable frame payload
	UnknownType(String),    // unrecognized message type
	FrameTooLarge,          // frame exceeds the configured byte cap

	// CRDT imports
	CorruptSnapshot(String),
	CorruptUpdate(String),

	// Persistence and I/O
	NotFound,
	CorruptPersisted(String), // on-disk document is not valid Lexical JSON
	WriteFailed(String),
	Timeout,

	// Transport
	SocketClosed,
	BackpressureExceeded,

	// externals
	Parse,
	Io(std::io::Error),
}

impl Error {
	/// Stable reason code for `{type: "error", reason}` frames.
	pub fn reason(&self) -> &'static str {
		match self {
			Error::InvalidInput(_) => "invalid_input",
			Error::UnknownParent(_) => "unknown_parent",
			Error::UnknownNode(_) => "unknown_node",
			Error::RootProtected => "root_protected",
			Error::DuplicateMapping(_) => "duplicate_mapping",
			Error::NoCurrentDocument => "no_current_document",
			Error::Uninitialized => "uninitialized",
			Error::AlreadyInitialized => "already_initialized",
			Error::ModelPoisoned => "model_poisoned",
			Error::MalformedFrame(_) => "malformed_frame",
			Error::UnknownType(_) => "unknown_type",
			Error::FrameTooLarge => "frame_too_large",
			Error::CorruptSnapshot(_) => "corrupt_snapshot",
			Error::CorruptUpdate(_) => "corrupt_update",
			Error::NotFound => "not_found",
			Error::CorruptPersisted(_) => "corrupt_persisted",
			Error::WriteFailed(_) => "write_failed",
			Error::Timeout => "timeout",
			Error::SocketClosed => "socket_closed",
			Error::BackpressureExceeded => "backpressure_exceeded",
			Error::Parse => "parse_error",
			Error::Io(_) => "io_error",
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		if err.kind() == std::io::ErrorKind::NotFound {
			return Self::NotFound;
		}
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(_err: serde_json::Error) -> Self {
		warn!("json error: {}", _err);
		Error::Parse
	}
}

impl From<tokio::time::error::Elapsed> for Error {
	fn from(_err: tokio::time::error::Elapsed) -> Self {
		Error::Timeout
	}
}

impl IntoResponse for Error {
	fn into_response(self) -> axum::response::Response {
		let (status, code, message) = match self {
			Error::NotFound => (
				StatusCode::NOT_FOUND,
				"E-DOC-NOTFOUND".to_string(),
				"Document not found".to_string(),
			),
			Error::InvalidInput(msg) => (
				StatusCode::BAD_REQUEST,
				"E-VAL-INVALID".to_string(),
				format!("Request validation failed: {}", msg),
			),
			Error::UnknownParent(key) => (
				StatusCode::NOT_FOUND,
				"E-DOC-NOPARENT".to_string(),
				format!("Parent node not found: {}", key),
			),
			Error::UnknownNode(key) => (
				StatusCode::NOT_FOUND,
				"E-DOC-NONODE".to_string(),
				format!("Node not found: {}", key),
			),
			Error::RootProtected => (
				StatusCode::CONFLICT,
				"E-DOC-ROOT".to_string(),
				"The document root cannot be removed".to_string(),
			),
			Error::DuplicateMapping(msg) => (
				StatusCode::CONFLICT,
				"E-DOC-DUPMAP".to_string(),
				format!("Mapping conflict: {}", msg),
			),
			Error::NoCurrentDocument => (
				StatusCode::BAD_REQUEST,
				"E-RPC-NOCURDOC".to_string(),
				"No document id given and no current document set".to_string(),
			),
			Error::Uninitialized => (
				StatusCode::CONFLICT,
				"E-DOC-UNINIT".to_string(),
				"Document model is not initialized".to_string(),
			),
			Error::AlreadyInitialized => (
				StatusCode::CONFLICT,
				"E-DOC-REINIT".to_string(),
				"Document model is already initialized".to_string(),
			),
			Error::Timeout => (
				StatusCode::REQUEST_TIMEOUT,
				"E-SYS-TIMEOUT".to_string(),
				"Operation timed out".to_string(),
			),
			Error::ModelPoisoned => (
				StatusCode::SERVICE_UNAVAILABLE,
				"E-DOC-POISONED".to_string(),
				"Document model is tainted and awaiting reload".to_string(),
			),
			// Server errors (5xx) - no message exposure for security
			Error::CorruptSnapshot(msg) | Error::CorruptUpdate(msg) => {
				warn!("crdt import error: {}", msg);
				(
					StatusCode::UNPROCESSABLE_ENTITY,
					"E-CRDT-IMPORT".to_string(),
					"CRDT payload could not be applied".to_string(),
				)
			}
			Error::CorruptPersisted(msg) => {
				warn!("corrupt persisted document: {}", msg);
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					"E-IO-CORRUPT".to_string(),
					"Internal server error".to_string(),
				)
			}
			Error::WriteFailed(msg) => {
				warn!("write failed: {}", msg);
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					"E-IO-WRITE".to_string(),
					"Internal server error".to_string(),
				)
			}
			Error::MalformedFrame(_) | Error::UnknownType(_) | Error::FrameTooLarge => (
				StatusCode::BAD_REQUEST,
				"E-WS-PROTO".to_string(),
				"Protocol error".to_string(),
			),
			Error::SocketClosed | Error::BackpressureExceeded => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-WS-SEND".to_string(),
				"Internal server error".to_string(),
			),
			Error::Parse => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-SYS-PARSE".to_string(),
				"Internal server error".to_string(),
			),
			Error::Io(_) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-SYS-IO".to_string(),
				"Internal server error".to_string(),
			),
		};

		let error_response = ErrorResponse::new(code, message);
		(status, Json(error_response)).into_response()
	}
}

// vim: ts=4

//! Command interface
//!
//! Exposes the structural edit verbs (`load_document`, `append_paragraph`,
//! `insert_paragraph`, `get_document_info`, `set_current_document`) as JSON
//! endpoints. Every verb goes through the registry and the document model
//! exactly like a hub edit, so the resulting update is emitted as a model
//! event and the hub delivers it to every connected client.
//!
//! The service holds a process-scoped "current document id": verbs that omit
//! `docId` target it, an explicit id always wins.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod handler;
pub mod service;

mod prelude;

pub use handler::router;
pub use service::CommandService;

// vim: ts=4

//! Model events
//!
//! Events are gathered while the model mutex is held and emitted only after
//! release, so a handler calling back into the model can never deadlock.

use coedit_types::message::WireMessage;

/// Event emitted by a [`crate::DocumentModel`] after a completed operation.
#[derive(Debug, Clone)]
pub enum ModelEvent {
	TreeNodeCreated {
		doc_id: String,
		lexical_key: String,
		tree_id: String,
		parent_key: String,
		index: Option<usize>,
	},
	TreeNodeUpdated {
		doc_id: String,
		lexical_key: String,
		tree_id: String,
	},
	TreeNodeDeleted {
		doc_id: String,
		lexical_key: String,
		tree_id: String,
	},
	/// Persistent (structural) state changed
	DocumentChanged {
		doc_id: String,
		modification_count: u64,
	},
	/// Transient per-peer state changed; never affects persistence
	EphemeralChanged {
		doc_id: String,
		keys: Vec<String>,
	},
	/// A remote-originated operation produced bytes other peers must receive
	BroadcastNeeded {
		doc_id: String,
		message: WireMessage,
	},
}

impl ModelEvent {
	pub fn doc_id(&self) -> &str {
		match self {
			ModelEvent::TreeNodeCreated { doc_id, .. }
			| ModelEvent::TreeNodeUpdated { doc_id, .. }
			| ModelEvent::TreeNodeDeleted { doc_id, .. }
			| ModelEvent::DocumentChanged { doc_id, .. }
			| ModelEvent::EphemeralChanged { doc_id, .. }
			| ModelEvent::BroadcastNeeded { doc_id, .. } => doc_id,
		}
	}
}

// vim: ts=4

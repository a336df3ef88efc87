//! Document model
//!
//! One `DocumentModel` per document id. The model owns the Loro document,
//! the `lexical` tree container, the key mapper and the ephemeral sub-store.
//! Every mutating entry point serializes on the model's async mutex; events
//! are gathered in an outbox while the mutex is held and emitted only after
//! release. Read/export paths take the same mutex, so no exporter ever runs
//! concurrently with a mutator on the same CRDT handle.
//!
//! A panic inside the CRDT layer taints the model: the flag is sticky and
//! every subsequent operation fails with `ModelPoisoned` until the registry
//! evicts the model and reloads it from the last persisted state.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};

use loro::awareness::EphemeralStore;
use loro::{ContainerTrait, ExportMode, LoroDoc, LoroTree, TreeID, TreeParentId, VersionVector};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard, broadcast};

use crate::converter;
use crate::event::ModelEvent;
use crate::mapper::NodeMapper;
use crate::prelude::*;
use coedit_types::message::{self, WireMessage};
use coedit_types::types::{DocumentInfo, Timestamp};

/// Name of the tree container holding the document
pub const TREE_NAME: &str = "lexical";

/// Sender id used for edits originating from the command interface
pub const SERVER_SENDER_ID: &str = "server";

/// Ephemeral entries expire after five minutes without refresh
const EPHEMERAL_TIMEOUT_MS: i64 = 300_000;

/// Message types understood by [`DocumentModel::handle_message`]
const REQ_SNAPSHOT: &str = "snapshot-request";

/// Capacity of the model event channel
const EVENT_CHANNEL_SIZE: usize = 64;

/// Structured result of a message handler, telling the hub what to send where.
#[derive(Debug, Clone, Default)]
pub struct HandleOutcome {
	/// Frame for every other client in the room
	pub broadcast: Option<WireMessage>,
	/// Frame for the requesting client only
	pub reply: Option<WireMessage>,
	/// Updated document summary, when the operation changed persistent state
	pub document_info: Option<DocumentInfo>,
}

struct ModelInner {
	doc: LoroDoc,
	tree: LoroTree,
	mapper: NodeMapper,
	root_id: Option<TreeID>,
	initialized: bool,
	modification_count: u64,
	last_broadcast_vv: VersionVector,
	persisted_hash: Option<String>,
	last_saved: Option<Timestamp>,
	ephemeral: EphemeralStore,
	/// Insertion order of ephemeral keys, for oldest-first eviction
	ephemeral_order: VecDeque<String>,
}

pub struct DocumentModel {
	doc_id: Box<str>,
	max_ephemeral_entries: usize,
	inner: Mutex<ModelInner>,
	events: broadcast::Sender<ModelEvent>,
	poisoned: AtomicBool,
}

impl DocumentModel {
	pub fn new(doc_id: impl Into<Box<str>>, max_ephemeral_entries: usize) -> Self {
		let doc = LoroDoc::new();
		let tree = doc.get_tree(TREE_NAME);
		tree.enable_fractional_index(0);
		let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

		Self {
			doc_id: doc_id.into(),
			max_ephemeral_entries,
			inner: Mutex::new(ModelInner {
				doc,
				tree,
				mapper: NodeMapper::new(),
				root_id: None,
				initialized: false,
				modification_count: 0,
				last_broadcast_vv: VersionVector::default(),
				persisted_hash: None,
				last_saved: None,
				ephemeral: EphemeralStore::new(EPHEMERAL_TIMEOUT_MS),
				ephemeral_order: VecDeque::new(),
			}),
			events,
			poisoned: AtomicBool::new(false),
		}
	}

	pub fn doc_id(&self) -> &str {
		&self.doc_id
	}

	pub fn is_poisoned(&self) -> bool {
		self.poisoned.load(Ordering::Acquire)
	}

	/// Subscribe to model events. Events are emitted after the mutex has been
	/// released, so handlers may call back into the model.
	pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
		self.events.subscribe()
	}

	async fn lock(&self) -> CoResult<MutexGuard<'_, ModelInner>> {
		if self.is_poisoned() {
			return Err(Error::ModelPoisoned);
		}
		Ok(self.inner.lock().await)
	}

	fn emit(&self, outbox: Vec<ModelEvent>) {
		for event in outbox {
			// No receivers is fine; nobody has subscribed yet
			let _ = self.events.send(event);
		}
	}

	// Initialization and export
	//***************************

	/// Build the tree from a Lexical state. Valid only once per model.
	pub async fn initialize_from_lexical(&self, state: &Value) -> CoResult<()> {
		let mut outbox = Vec::new();
		{
			let mut inner = self.lock().await?;
			if inner.initialized {
				return Err(Error::AlreadyInitialized);
			}

			let root_id = converter::import_from_lexical(&inner.tree, state)?;
			inner.doc.commit();
			inner.mapper.clear();
			let tree = inner.tree.clone();
			inner.mapper.sync_existing(&tree)?;

			inner.root_id = Some(root_id);
			inner.initialized = true;
			inner.modification_count += 1;
			outbox.push(ModelEvent::DocumentChanged {
				doc_id: self.doc_id.to_string(),
				modification_count: inner.modification_count,
			});
			info!("Initialized document {} with root {}", self.doc_id, converter::tree_id_str(root_id));
		}
		self.emit(outbox);
		Ok(())
	}

	/// Export the current tree as Lexical JSON with fresh `__key`s.
	pub async fn export_lexical(&self) -> CoResult<Value> {
		let inner = self.lock().await?;
		let root_id = Self::require_root(&inner)?;
		converter::export_lexical(&inner.tree, root_id)
	}

	/// Export plus the content hash of the exported state, in one critical
	/// section, for the registry's save path.
	pub async fn export_for_save(&self) -> CoResult<(Value, String)> {
		let inner = self.lock().await?;
		let root_id = Self::require_root(&inner)?;
		let state = converter::export_lexical(&inner.tree, root_id)?;
		let hash = content_hash_of(&state);
		Ok((state, hash))
	}

	/// Record a successful persist of the state whose hash is `hash`.
	pub async fn mark_saved(&self, hash: String) -> CoResult<()> {
		let mut inner = self.lock().await?;
		inner.persisted_hash = Some(hash);
		inner.last_saved = Some(Timestamp::now());
		Ok(())
	}

	/// True iff the current content differs from the last persisted state.
	pub async fn has_changed_since_last_save(&self) -> bool {
		let Ok(inner) = self.lock().await else { return false };
		if !inner.initialized {
			return false;
		}
		let Ok(root_id) = Self::require_root(&inner) else { return false };
		let Ok(state) = converter::export_lexical(&inner.tree, root_id) else { return true };
		let hash = content_hash_of(&state);
		inner.persisted_hash.as_deref() != Some(hash.as_str())
	}

	fn require_root(inner: &ModelInner) -> CoResult<TreeID> {
		if !inner.initialized {
			return Err(Error::Uninitialized);
		}
		inner.root_id.or_else(|| converter::find_root(&inner.tree)).ok_or(Error::Uninitialized)
	}

	// Structural edits
	//******************

	/// Create a block under `parent_key`. `index` beyond the end appends.
	/// Returns the lexical key of the new block.
	pub async fn add_block(
		&self,
		parent_key: &str,
		data: &Value,
		index: Option<usize>,
	) -> CoResult<String> {
		let mut outbox = Vec::new();
		let new_key = {
			let mut inner = self.lock().await?;
			if !inner.initialized {
				return Err(Error::Uninitialized);
			}
			let key = Self::add_block_locked(&mut inner, parent_key, data, index)?;
			inner.doc.commit();
			inner.modification_count += 1;
			Self::push_change_events(&self.doc_id, &inner, &key, parent_key, index, &mut outbox);
			key
		};
		self.emit(outbox);
		Ok(new_key)
	}

	fn add_block_locked(
		inner: &mut ModelInner,
		parent_key: &str,
		data: &Value,
		index: Option<usize>,
	) -> CoResult<String> {
		let block = data
			.as_object()
			.ok_or_else(|| Error::InvalidInput("block data must be an object".into()))?;
		let element_type = block
			.get("type")
			.and_then(Value::as_str)
			.filter(|t| !t.is_empty())
			.ok_or_else(|| Error::InvalidInput("block data must contain 'type'".into()))?;

		let parent_id = inner
			.mapper
			.lookup_by_key(parent_key)
			.ok_or_else(|| Error::UnknownParent(parent_key.to_string()))?;

		let child_count = converter::children_of(&inner.tree, parent_id).len();
		let insert_at = index.map_or(child_count, |i| i.min(child_count));

		let node_id = inner
			.tree
			.create_at(TreeParentId::Node(parent_id), insert_at)
			.map_err(|e| Error::InvalidInput(format!("cannot create node: {}", e)))?;
		converter::set_node_meta(
			&inner.tree,
			node_id,
			element_type,
			converter::clean_lexical_data(block),
		)?;

		let new_key = coedit_types::utils::random_lexical_key();
		inner.mapper.create(new_key.clone(), node_id)?;

		// Nested children in the block data become child nodes
		if let Some(children) = block.get("children").and_then(Value::as_array) {
			for (child_index, child) in children.iter().enumerate() {
				let child_block = child
					.as_object()
					.ok_or_else(|| Error::InvalidInput("child block must be an object".into()))?;
				Self::add_block_locked(
					inner,
					&new_key,
					&Value::Object(child_block.clone()),
					Some(child_index),
				)?;
			}
		}

		Ok(new_key)
	}

	fn push_change_events(
		doc_id: &str,
		inner: &ModelInner,
		key: &str,
		parent_key: &str,
		index: Option<usize>,
		outbox: &mut Vec<ModelEvent>,
	) {
		let tree_id = inner
			.mapper
			.lookup_by_key(key)
			.map(converter::tree_id_str)
			.unwrap_or_default();
		outbox.push(ModelEvent::TreeNodeCreated {
			doc_id: doc_id.to_string(),
			lexical_key: key.to_string(),
			tree_id,
			parent_key: parent_key.to_string(),
			index,
		});
		outbox.push(ModelEvent::DocumentChanged {
			doc_id: doc_id.to_string(),
			modification_count: inner.modification_count,
		});
	}

	/// Replace a node's metadata. The element type changes only when the new
	/// data carries a `type` field.
	pub async fn update_block(&self, key: &str, data: &Value) -> CoResult<()> {
		let mut outbox = Vec::new();
		{
			let mut inner = self.lock().await?;
			if !inner.initialized {
				return Err(Error::Uninitialized);
			}
			let node_id =
				inner.mapper.lookup_by_key(key).ok_or_else(|| Error::UnknownNode(key.to_string()))?;
			let block = data
				.as_object()
				.ok_or_else(|| Error::InvalidInput("block data must be an object".into()))?;

			let element_type = match block.get("type").and_then(Value::as_str) {
				Some(t) if !t.is_empty() => t.to_string(),
				_ => converter::element_type_of(&inner.tree, node_id)?,
			};
			converter::set_node_meta(
				&inner.tree,
				node_id,
				&element_type,
				converter::clean_lexical_data(block),
			)?;
			inner.doc.commit();
			inner.modification_count += 1;

			outbox.push(ModelEvent::TreeNodeUpdated {
				doc_id: self.doc_id.to_string(),
				lexical_key: key.to_string(),
				tree_id: converter::tree_id_str(node_id),
			});
			outbox.push(ModelEvent::DocumentChanged {
				doc_id: self.doc_id.to_string(),
				modification_count: inner.modification_count,
			});
		}
		self.emit(outbox);
		Ok(())
	}

	/// Delete a node and its subtree. The root cannot be removed.
	pub async fn remove_block(&self, key: &str) -> CoResult<()> {
		let mut outbox = Vec::new();
		{
			let mut inner = self.lock().await?;
			if !inner.initialized {
				return Err(Error::Uninitialized);
			}
			let node_id =
				inner.mapper.lookup_by_key(key).ok_or_else(|| Error::UnknownNode(key.to_string()))?;
			if inner.root_id == Some(node_id) {
				return Err(Error::RootProtected);
			}

			inner.mapper.remove_by_key(key);
			inner
				.tree
				.delete(node_id)
				.map_err(|e| Error::UnknownNode(format!("{}: {}", key, e)))?;
			// Drop mappings of the deleted subtree as well
			let tree = inner.tree.clone();
			inner.mapper.sync_existing(&tree)?;
			inner.doc.commit();
			inner.modification_count += 1;

			outbox.push(ModelEvent::TreeNodeDeleted {
				doc_id: self.doc_id.to_string(),
				lexical_key: key.to_string(),
				tree_id: converter::tree_id_str(node_id),
			});
			outbox.push(ModelEvent::DocumentChanged {
				doc_id: self.doc_id.to_string(),
				modification_count: inner.modification_count,
			});
		}
		self.emit(outbox);
		Ok(())
	}

	/// Lexical keys of every node with the given element type.
	pub async fn find_by_type(&self, element_type: &str) -> CoResult<Vec<String>> {
		let inner = self.lock().await?;
		let mut keys = Vec::new();
		for node_id in inner.tree.nodes() {
			if converter::element_type_of(&inner.tree, node_id)? == element_type {
				if let Some(key) = inner.mapper.lookup_by_id(node_id) {
					keys.push(key.to_string());
				}
			}
		}
		Ok(keys)
	}

	/// Append a paragraph block with a single text child under the root.
	/// Returns the paragraph's lexical key and the new top-level block count.
	pub async fn append_paragraph(&self, text: &str) -> CoResult<(String, usize)> {
		self.insert_paragraph_impl(None, text).await.map(|(key, _, total)| (key, total))
	}

	/// Insert a paragraph at `index` among the root's children; an index
	/// beyond the end appends. Returns (key, actual index, total blocks).
	pub async fn insert_paragraph(&self, index: usize, text: &str) -> CoResult<(String, usize, usize)> {
		self.insert_paragraph_impl(Some(index), text).await
	}

	async fn insert_paragraph_impl(
		&self,
		index: Option<usize>,
		text: &str,
	) -> CoResult<(String, usize, usize)> {
		let mut outbox = Vec::new();
		let result = {
			let mut inner = self.lock().await?;
			let root_id = Self::require_root(&inner)?;
			let root_key = inner
				.mapper
				.lookup_by_id(root_id)
				.map(str::to_string)
				.ok_or(Error::Uninitialized)?;

			let child_count = converter::children_of(&inner.tree, root_id).len();
			let actual_index = index.map_or(child_count, |i| i.min(child_count));

			let paragraph = json!({
				"type": "paragraph",
				"direction": null,
				"format": "",
				"indent": 0,
				"version": 1,
				"textFormat": 0,
				"textStyle": "",
				"children": [
					{
						"type": "text",
						"text": text,
						"detail": 0,
						"format": 0,
						"mode": "normal",
						"style": "",
						"version": 1
					}
				]
			});
			let key = Self::add_block_locked(&mut inner, &root_key, &paragraph, Some(actual_index))?;
			inner.doc.commit();
			inner.modification_count += 1;

			let total = converter::children_of(&inner.tree, root_id).len();
			Self::push_change_events(&self.doc_id, &inner, &key, &root_key, Some(actual_index), &mut outbox);
			(key, actual_index, total)
		};
		self.emit(outbox);
		Ok(result)
	}

	// Snapshot and update I/O
	//*************************

	/// Full self-contained snapshot of the CRDT document.
	pub async fn get_snapshot(&self) -> CoResult<Vec<u8>> {
		let inner = self.lock().await?;
		inner
			.doc
			.export(ExportMode::Snapshot)
			.map_err(|e| Error::WriteFailed(format!("snapshot export: {}", e)))
	}

	/// Import a full snapshot. On success the model is initialized iff the
	/// imported tree has a root.
	pub async fn import_snapshot(&self, bytes: &[u8]) -> CoResult<()> {
		self.import_bytes(bytes, true).await
	}

	/// Apply an incremental update. Idempotent by the CRDT's guarantees.
	pub async fn apply_update(&self, bytes: &[u8]) -> CoResult<()> {
		self.import_bytes(bytes, false).await
	}

	async fn import_bytes(&self, bytes: &[u8], snapshot: bool) -> CoResult<()> {
		let mut outbox = Vec::new();
		{
			let mut inner = self.lock().await?;

			// CRDT import is atomic: either the whole payload applies or the
			// document is left untouched. A panic below taints the model.
			let import_result = {
				let doc = &inner.doc;
				catch_unwind(AssertUnwindSafe(|| doc.import(bytes)))
			};
			match import_result {
				Err(_) => {
					self.poisoned.store(true, Ordering::Release);
					error!("CRDT import panicked, tainting model {}", self.doc_id);
					return Err(Error::ModelPoisoned);
				}
				Ok(Err(e)) if snapshot => return Err(Error::CorruptSnapshot(e.to_string())),
				Ok(Err(e)) => return Err(Error::CorruptUpdate(e.to_string())),
				Ok(Ok(_status)) => {}
			}

			let tree = inner.tree.clone();
			inner.mapper.sync_existing(&tree)?;
			inner.root_id = converter::find_root(&inner.tree);
			if inner.root_id.is_some() {
				inner.initialized = true;
			}
			inner.modification_count += 1;

			outbox.push(ModelEvent::DocumentChanged {
				doc_id: self.doc_id.to_string(),
				modification_count: inner.modification_count,
			});
		}
		self.emit(outbox);
		Ok(())
	}

	/// Delta bringing a peer at `vv` up to the local frontier, or `None` when
	/// the peer is already current.
	pub async fn export_update_since(&self, vv: &VersionVector) -> CoResult<Option<Vec<u8>>> {
		let inner = self.lock().await?;
		Self::export_update_since_locked(&inner, vv)
	}

	fn export_update_since_locked(
		inner: &ModelInner,
		vv: &VersionVector,
	) -> CoResult<Option<Vec<u8>>> {
		if inner.doc.oplog_vv() == *vv {
			return Ok(None);
		}
		inner
			.doc
			.export(ExportMode::Updates { from: Cow::Borrowed(vv) })
			.map(Some)
			.map_err(|e| Error::WriteFailed(format!("update export: {}", e)))
	}

	/// Version vector at the last successful rebroadcast.
	pub async fn last_broadcast_vv(&self) -> CoResult<VersionVector> {
		Ok(self.lock().await?.last_broadcast_vv.clone())
	}

	/// Advance the last-broadcast marker to the current frontier.
	pub async fn advance_broadcast_vv(&self) -> CoResult<()> {
		let mut inner = self.lock().await?;
		inner.last_broadcast_vv = inner.doc.oplog_vv();
		Ok(())
	}

	/// True iff local changes have not been rebroadcast yet.
	pub async fn has_unbroadcast_changes(&self) -> CoResult<bool> {
		let inner = self.lock().await?;
		Ok(inner.doc.oplog_vv() != inner.last_broadcast_vv)
	}

	// Info
	//******

	pub async fn document_info(&self) -> CoResult<DocumentInfo> {
		let inner = self.lock().await?;
		let total_blocks = inner
			.root_id
			.map(|root| converter::children_of(&inner.tree, root).len())
			.unwrap_or(0);

		Ok(DocumentInfo {
			doc_id: self.doc_id.to_string(),
			total_blocks,
			block_types: converter::tree_stats(&inner.tree),
			container_id: inner.tree.id().to_string(),
			modification_count: inner.modification_count,
			version: inner.doc.len_changes() as u64,
			initialized: inner.initialized,
			last_saved: inner.last_saved,
		})
	}

	// Message handlers (dispatched by the hub)
	//******************************************

	/// Handle a document-level message from a peer.
	///
	/// Recognized types: `snapshot-request`, `snapshot`, `update`,
	/// `append-paragraph`, `insert-paragraph`.
	pub async fn handle_message(
		&self,
		msg_type: &str,
		msg: &WireMessage,
		client_id: &str,
	) -> CoResult<HandleOutcome> {
		match msg_type {
			REQ_SNAPSHOT => {
				let bytes = self.get_snapshot().await?;
				Ok(HandleOutcome {
					reply: Some(WireMessage::snapshot(&self.doc_id, &bytes)),
					..Default::default()
				})
			}
			message::MSG_SNAPSHOT => {
				self.import_snapshot(&msg.bytes()?).await?;
				Ok(HandleOutcome {
					document_info: Some(self.document_info().await?),
					..Default::default()
				})
			}
			message::MSG_UPDATE => {
				let bytes = msg.bytes()?;
				self.apply_update(&bytes).await?;
				// The bytes are rebroadcast verbatim, so the remote state
				// they encode counts as broadcast.
				self.advance_broadcast_vv().await?;
				let broadcast = WireMessage::update(&self.doc_id, &bytes, Some(client_id));
				self.emit(vec![ModelEvent::BroadcastNeeded {
					doc_id: self.doc_id.to_string(),
					message: broadcast.clone(),
				}]);
				Ok(HandleOutcome { broadcast: Some(broadcast), ..Default::default() })
			}
			message::MSG_APPEND_PARAGRAPH => {
				let text = msg.payload.get("text").and_then(Value::as_str).unwrap_or_default();
				self.append_paragraph(text).await?;
				self.broadcast_pending_update(client_id).await
			}
			message::MSG_INSERT_PARAGRAPH => {
				let index = msg
					.payload
					.get("index")
					.and_then(Value::as_u64)
					.ok_or_else(|| Error::MalformedFrame("missing 'index' field".into()))?;
				let text = msg.payload.get("text").and_then(Value::as_str).unwrap_or_default();
				self.insert_paragraph(index as usize, text).await?;
				self.broadcast_pending_update(client_id).await
			}
			other => Err(Error::UnknownType(other.to_string())),
		}
	}

	/// Export everything since the last broadcast as one update frame and
	/// advance the marker. Shared by hub edits and the command interface.
	pub async fn broadcast_pending_update(&self, sender_id: &str) -> CoResult<HandleOutcome> {
		let delta = {
			let mut inner = self.lock().await?;
			let vv = inner.last_broadcast_vv.clone();
			let delta = Self::export_update_since_locked(&inner, &vv)?;
			if delta.is_some() {
				inner.last_broadcast_vv = inner.doc.oplog_vv();
			}
			delta
		};

		let Some(bytes) = delta else { return Ok(HandleOutcome::default()) };
		let broadcast = WireMessage::update(&self.doc_id, &bytes, Some(sender_id));
		self.emit(vec![ModelEvent::BroadcastNeeded {
			doc_id: self.doc_id.to_string(),
			message: broadcast.clone(),
		}]);
		Ok(HandleOutcome {
			broadcast: Some(broadcast),
			document_info: Some(self.document_info().await?),
			..Default::default()
		})
	}

	/// Handle an ephemeral (presence) message from a peer.
	///
	/// Recognized kinds: `cursor`, `selection`, `awareness`, `ephemeral`,
	/// and `query` (returns the encoded blob to the requester only).
	pub async fn handle_ephemeral(
		&self,
		kind: &str,
		msg: &WireMessage,
		client_id: &str,
	) -> CoResult<HandleOutcome> {
		match kind {
			"cursor" | "selection" | "awareness" | "ephemeral" => {
				let mut outbox = Vec::new();
				let blob = {
					let mut inner = self.lock().await?;
					let key = format!("{}:{}", kind, client_id);
					let payload = Value::Object(msg.payload.clone());
					inner
						.ephemeral
						.set(&key, crate::value::loro_value_from_json(&payload)?);
					Self::track_ephemeral_key(&mut inner, key.clone(), self.max_ephemeral_entries);
					outbox.push(ModelEvent::EphemeralChanged {
						doc_id: self.doc_id.to_string(),
						keys: vec![key],
					});
					inner.ephemeral.encode_all()
				};

				let broadcast = WireMessage::ephemeral(&self.doc_id, &blob, Some(client_id));
				outbox.push(ModelEvent::BroadcastNeeded {
					doc_id: self.doc_id.to_string(),
					message: broadcast.clone(),
				});
				self.emit(outbox);
				Ok(HandleOutcome { broadcast: Some(broadcast), ..Default::default() })
			}
			"query" => {
				let inner = self.lock().await?;
				let blob = inner.ephemeral.encode_all();
				Ok(HandleOutcome {
					reply: Some(WireMessage::ephemeral(&self.doc_id, &blob, None)),
					..Default::default()
				})
			}
			other => Err(Error::UnknownType(other.to_string())),
		}
	}

	fn track_ephemeral_key(inner: &mut ModelInner, key: String, max_entries: usize) {
		if !inner.ephemeral_order.contains(&key) {
			inner.ephemeral_order.push_back(key);
		}
		while inner.ephemeral_order.len() > max_entries {
			if let Some(oldest) = inner.ephemeral_order.pop_front() {
				inner.ephemeral.delete(&oldest);
			}
		}
	}

	/// Encoded ephemeral state, or `None` when the store is empty.
	pub async fn ephemeral_blob(&self) -> CoResult<Option<Vec<u8>>> {
		let inner = self.lock().await?;
		if inner.ephemeral.keys().is_empty() {
			return Ok(None);
		}
		Ok(Some(inner.ephemeral.encode_all()))
	}

	/// Drop every ephemeral entry belonging to a disconnected client.
	/// Returns the removed keys.
	pub async fn on_client_disconnect(&self, client_id: &str) -> CoResult<Vec<String>> {
		let mut outbox = Vec::new();
		let removed = {
			let mut inner = self.lock().await?;
			let suffix = format!(":{}", client_id);
			let removed: Vec<String> = inner
				.ephemeral
				.keys()
				.into_iter()
				.filter(|key| key.ends_with(&suffix))
				.collect();
			for key in &removed {
				inner.ephemeral.delete(key);
			}
			inner.ephemeral_order.retain(|key| !removed.contains(key));
			if !removed.is_empty() {
				outbox.push(ModelEvent::EphemeralChanged {
					doc_id: self.doc_id.to_string(),
					keys: removed.clone(),
				});
			}
			removed
		};
		self.emit(outbox);
		Ok(removed)
	}
}

/// Stable digest over a Lexical state with the ephemeral `__key` fields
/// stripped. `serde_json` objects iterate in sorted key order, so the
/// serialization is deterministic.
pub fn content_hash_of(state: &Value) -> String {
	fn strip_keys(value: &Value) -> Value {
		match value {
			Value::Object(map) => Value::Object(
				map.iter()
					.filter(|(k, _)| k.as_str() != "__key")
					.map(|(k, v)| (k.clone(), strip_keys(v)))
					.collect(),
			),
			Value::Array(items) => Value::Array(items.iter().map(strip_keys).collect()),
			other => other.clone(),
		}
	}

	let normalized = strip_keys(state).to_string();
	let digest = Sha256::digest(normalized.as_bytes());
	let mut hex = String::with_capacity(digest.len() * 2);
	for byte in digest {
		hex.push_str(&format!("{:02x}", byte));
	}
	hex
}

#[cfg(test)]
mod tests {
	use super::*;
	use coedit_types::config::default_initial_state;

	fn model() -> DocumentModel {
		DocumentModel::new("doc-test", 64)
	}

	async fn initialized_model() -> DocumentModel {
		let m = model();
		m.initialize_from_lexical(&default_initial_state()).await.unwrap();
		m
	}

	async fn root_key(m: &DocumentModel) -> String {
		m.find_by_type("root").await.unwrap().remove(0)
	}

	#[tokio::test]
	async fn test_initialize_only_once() {
		let m = initialized_model().await;
		let result = m.initialize_from_lexical(&default_initial_state()).await;
		assert!(matches!(result, Err(Error::AlreadyInitialized)));
	}

	#[tokio::test]
	async fn test_operations_fail_uninitialized() {
		let m = model();
		assert!(matches!(m.export_lexical().await, Err(Error::Uninitialized)));
		assert!(matches!(m.append_paragraph("x").await, Err(Error::Uninitialized)));
		assert!(matches!(
			m.add_block("nope", &json!({"type": "paragraph"}), None).await,
			Err(Error::Uninitialized)
		));
	}

	#[tokio::test]
	async fn test_seed_roundtrip() {
		let m = initialized_model().await;
		let exported = m.export_lexical().await.unwrap();

		assert_eq!(exported["root"]["type"], "root");
		let children = exported["root"]["children"].as_array().unwrap();
		assert_eq!(children.len(), 2);
		assert_eq!(children[0]["children"][0]["text"], "Lexical with Loro");
	}

	#[tokio::test]
	async fn test_append_and_insert_paragraph_order() {
		let m = model();
		m.initialize_from_lexical(&json!({ "root": { "type": "root", "children": [] } }))
			.await
			.unwrap();

		for text in ["p1", "p2", "p3", "p4"] {
			m.append_paragraph(text).await.unwrap();
		}
		let (_, index, total) = m.insert_paragraph(2, "X").await.unwrap();
		assert_eq!(index, 2);
		assert_eq!(total, 5);

		let exported = m.export_lexical().await.unwrap();
		let texts: Vec<&str> = exported["root"]["children"]
			.as_array()
			.unwrap()
			.iter()
			.map(|p| p["children"][0]["text"].as_str().unwrap())
			.collect();
		assert_eq!(texts, vec!["p1", "p2", "X", "p3", "p4"]);
	}

	#[tokio::test]
	async fn test_insert_beyond_end_appends() {
		let m = model();
		m.initialize_from_lexical(&json!({ "root": { "type": "root", "children": [] } }))
			.await
			.unwrap();
		m.append_paragraph("a").await.unwrap();

		let (_, index, total) = m.insert_paragraph(99, "b").await.unwrap();
		assert_eq!(index, 1);
		assert_eq!(total, 2);
	}

	#[tokio::test]
	async fn test_add_block_unknown_parent() {
		let m = initialized_model().await;
		let result = m.add_block("missing-key", &json!({"type": "paragraph"}), None).await;
		assert!(matches!(result, Err(Error::UnknownParent(_))));
	}

	#[tokio::test]
	async fn test_add_block_requires_type() {
		let m = initialized_model().await;
		let root = root_key(&m).await;
		let result = m.add_block(&root, &json!({"text": "no type"}), None).await;
		assert!(matches!(result, Err(Error::InvalidInput(_))));
	}

	#[tokio::test]
	async fn test_update_block_changes_metadata() {
		let m = initialized_model().await;
		let root = root_key(&m).await;
		let key = m
			.add_block(&root, &json!({"type": "paragraph", "indent": 0}), None)
			.await
			.unwrap();

		m.update_block(&key, &json!({"type": "quote", "indent": 2})).await.unwrap();

		assert!(m.find_by_type("quote").await.unwrap().contains(&key));
		assert!(matches!(
			m.update_block("missing", &json!({"indent": 1})).await,
			Err(Error::UnknownNode(_))
		));
	}

	#[tokio::test]
	async fn test_remove_block_and_root_protection() {
		let m = initialized_model().await;
		let root = root_key(&m).await;
		let key = m.add_block(&root, &json!({"type": "paragraph"}), None).await.unwrap();

		m.remove_block(&key).await.unwrap();
		assert!(matches!(m.remove_block(&key).await, Err(Error::UnknownNode(_))));
		assert!(matches!(m.remove_block(&root).await, Err(Error::RootProtected)));

		// Root survives
		assert_eq!(m.find_by_type("root").await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_snapshot_reproduces_state() {
		let m = initialized_model().await;
		m.append_paragraph("from snapshot").await.unwrap();
		let snapshot = m.get_snapshot().await.unwrap();

		let m2 = model();
		m2.import_snapshot(&snapshot).await.unwrap();

		let a = m.export_lexical().await.unwrap();
		let b = m2.export_lexical().await.unwrap();
		assert_eq!(content_hash_of(&a), content_hash_of(&b));
	}

	#[tokio::test]
	async fn test_update_application_is_idempotent() {
		let m1 = initialized_model().await;
		let m2 = model();
		m2.import_snapshot(&m1.get_snapshot().await.unwrap()).await.unwrap();

		let vv = m1.last_broadcast_vv().await.unwrap();
		m1.append_paragraph("hello").await.unwrap();
		let update = m1.export_update_since(&vv).await.unwrap().unwrap();

		m2.apply_update(&update).await.unwrap();
		m2.apply_update(&update).await.unwrap();

		let a = m1.export_lexical().await.unwrap();
		let b = m2.export_lexical().await.unwrap();
		assert_eq!(content_hash_of(&a), content_hash_of(&b));
		assert_eq!(b["root"]["children"].as_array().unwrap().len(), 3);
	}

	#[tokio::test]
	async fn test_snapshot_subsumes_its_updates() {
		let m1 = initialized_model().await;
		let before_edit = m1.last_broadcast_vv().await.unwrap();
		m1.append_paragraph("subsumed").await.unwrap();
		let update = m1.export_update_since(&before_edit).await.unwrap().unwrap();
		let snapshot = m1.get_snapshot().await.unwrap();

		// Importing the snapshot and then an update it already contains
		// leaves the state unchanged.
		let m2 = model();
		m2.import_snapshot(&snapshot).await.unwrap();
		let before = content_hash_of(&m2.export_lexical().await.unwrap());
		m2.apply_update(&update).await.unwrap();
		let after = content_hash_of(&m2.export_lexical().await.unwrap());
		assert_eq!(before, after);
	}

	#[tokio::test]
	async fn test_concurrent_edits_converge() {
		let m1 = initialized_model().await;
		let m2 = model();
		m2.import_snapshot(&m1.get_snapshot().await.unwrap()).await.unwrap();

		m1.append_paragraph("from m1").await.unwrap();
		m2.append_paragraph("from m2").await.unwrap();

		let empty = VersionVector::default();
		let u1 = m1.export_update_since(&empty).await.unwrap().unwrap();
		let u2 = m2.export_update_since(&empty).await.unwrap().unwrap();
		m1.apply_update(&u2).await.unwrap();
		m2.apply_update(&u1).await.unwrap();

		let a = m1.export_lexical().await.unwrap();
		let b = m2.export_lexical().await.unwrap();
		assert_eq!(content_hash_of(&a), content_hash_of(&b));
		assert_eq!(a["root"]["children"].as_array().unwrap().len(), 4);
	}

	#[tokio::test]
	async fn test_concurrent_appends_serialize_on_the_mutex() {
		let m = std::sync::Arc::new(initialized_model().await);

		let mut handles = Vec::new();
		for n in 0..8 {
			let m = m.clone();
			handles.push(tokio::spawn(async move {
				m.append_paragraph(&format!("task {}", n)).await
			}));
		}
		let mut keys = Vec::new();
		for handle in handles {
			let (key, _) = handle.await.unwrap().unwrap();
			keys.push(key);
		}

		// Every call landed, no key was handed out twice
		let info = m.document_info().await.unwrap();
		assert_eq!(info.total_blocks, 2 + 8);
		keys.sort();
		keys.dedup();
		assert_eq!(keys.len(), 8);
	}

	#[tokio::test]
	async fn test_corrupt_payload_leaves_state_intact() {
		let m = initialized_model().await;
		let before = content_hash_of(&m.export_lexical().await.unwrap());

		assert!(matches!(
			m.apply_update(&[0xde, 0xad, 0xbe, 0xef]).await,
			Err(Error::CorruptUpdate(_))
		));

		let after = content_hash_of(&m.export_lexical().await.unwrap());
		assert_eq!(before, after);
	}

	#[tokio::test]
	async fn test_change_detection() {
		let m = initialized_model().await;
		assert!(m.has_changed_since_last_save().await);

		let (_, hash) = m.export_for_save().await.unwrap();
		m.mark_saved(hash).await.unwrap();
		assert!(!m.has_changed_since_last_save().await);

		m.append_paragraph("dirty again").await.unwrap();
		assert!(m.has_changed_since_last_save().await);
	}

	#[tokio::test]
	async fn test_unbroadcast_changes_tracking() {
		let m = initialized_model().await;
		assert!(m.has_unbroadcast_changes().await.unwrap());

		m.advance_broadcast_vv().await.unwrap();
		assert!(!m.has_unbroadcast_changes().await.unwrap());

		m.append_paragraph("new").await.unwrap();
		assert!(m.has_unbroadcast_changes().await.unwrap());
	}

	#[tokio::test]
	async fn test_handle_append_paragraph_message() {
		let m = initialized_model().await;
		m.advance_broadcast_vv().await.unwrap();

		let msg = WireMessage::new("append-paragraph", "doc-test", json!({ "text": "hi" }));
		let outcome = m.handle_message("append-paragraph", &msg, "client-1").await.unwrap();

		let broadcast = outcome.broadcast.unwrap();
		assert_eq!(broadcast.msg_type, "update");
		assert!(!broadcast.bytes().unwrap().is_empty());

		// The broadcast marker advanced, so a repeat finds nothing new
		assert!(!m.has_unbroadcast_changes().await.unwrap());
	}

	#[tokio::test]
	async fn test_handle_snapshot_request() {
		let m = initialized_model().await;
		let msg = WireMessage::new("snapshot-request", "doc-test", json!({}));
		let outcome = m.handle_message("snapshot-request", &msg, "client-1").await.unwrap();

		let reply = outcome.reply.unwrap();
		assert_eq!(reply.msg_type, "snapshot");

		let m2 = model();
		m2.import_snapshot(&reply.bytes().unwrap()).await.unwrap();
		assert_eq!(
			content_hash_of(&m.export_lexical().await.unwrap()),
			content_hash_of(&m2.export_lexical().await.unwrap()),
		);
	}

	#[tokio::test]
	async fn test_handle_unknown_message_type() {
		let m = initialized_model().await;
		let msg = WireMessage::new("mystery", "doc-test", json!({}));
		assert!(matches!(
			m.handle_message("mystery", &msg, "client-1").await,
			Err(Error::UnknownType(_))
		));
	}

	#[tokio::test]
	async fn test_ephemeral_store_and_disconnect_cleanup() {
		let m = initialized_model().await;

		let msg = WireMessage::new("cursor-position", "doc-test", json!({ "position": 12 }));
		let outcome = m.handle_ephemeral("cursor", &msg, "client-A").await.unwrap();
		assert_eq!(outcome.broadcast.unwrap().msg_type, "ephemeral");
		assert!(m.ephemeral_blob().await.unwrap().is_some());

		let removed = m.on_client_disconnect("client-A").await.unwrap();
		assert_eq!(removed, vec!["cursor:client-A".to_string()]);
		assert!(m.ephemeral_blob().await.unwrap().is_none());

		// Unknown clients remove nothing
		assert!(m.on_client_disconnect("client-B").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_ephemeral_entry_cap_evicts_oldest() {
		let m = DocumentModel::new("doc-cap", 2);
		m.initialize_from_lexical(&default_initial_state()).await.unwrap();

		for client in ["a", "b", "c"] {
			let msg = WireMessage::new("cursor-position", "doc-cap", json!({ "position": 1 }));
			m.handle_ephemeral("cursor", &msg, client).await.unwrap();
		}

		assert!(m.on_client_disconnect("a").await.unwrap().is_empty());
		assert_eq!(m.on_client_disconnect("c").await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_ephemeral_never_touches_content() {
		let m = initialized_model().await;
		let (_, hash) = m.export_for_save().await.unwrap();
		m.mark_saved(hash).await.unwrap();

		let msg = WireMessage::new("awareness-update", "doc-test", json!({ "state": { "x": 1 } }));
		m.handle_ephemeral("awareness", &msg, "client-A").await.unwrap();

		assert!(!m.has_changed_since_last_save().await);
	}

	#[tokio::test]
	async fn test_events_emitted_after_mutation() {
		let m = initialized_model().await;
		let mut events = m.subscribe();

		m.append_paragraph("ping").await.unwrap();

		let mut saw_created = false;
		let mut saw_changed = false;
		while let Ok(event) = events.try_recv() {
			match event {
				ModelEvent::TreeNodeCreated { .. } => saw_created = true,
				ModelEvent::DocumentChanged { .. } => saw_changed = true,
				_ => {}
			}
		}
		assert!(saw_created && saw_changed);
	}

	#[test]
	fn test_content_hash_ignores_keys() {
		let a = json!({ "root": { "type": "root", "__key": "aaa", "children": [] } });
		let b = json!({ "root": { "type": "root", "__key": "bbb", "children": [] } });
		assert_eq!(content_hash_of(&a), content_hash_of(&b));

		let c = json!({ "root": { "type": "root", "indent": 1, "children": [] } });
		assert_ne!(content_hash_of(&a), content_hash_of(&c));
	}
}

// vim: ts=4

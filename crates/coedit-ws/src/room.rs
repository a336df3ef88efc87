//! Room management
//!
//! A room is the set of clients currently joined to one document id. Rooms
//! are created lazily on the first join and destroyed when the last client
//! leaves. Each client owns a bounded send queue; a full or closed queue
//! marks the client for removal after the broadcast completes, so one slow
//! socket never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use axum::extract::ws::Message;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::prelude::*;
use coedit_model::{DocumentModel, ModelEvent};
use coedit_types::message::WireMessage;
use coedit_types::types::{ClientId, Timestamp};
use coedit_types::utils::{color_for_client, random_id};

/// Outbound frames buffered per client before it counts as backpressured
const CLIENT_QUEUE_SIZE: usize = 256;

/// One connected client
pub struct ClientHandle {
	pub id: ClientId,
	pub color: &'static str,
	pub connected_at: Timestamp,
	sender: mpsc::Sender<Message>,
	/// Wakes the connection task to terminate on eviction
	kill: Notify,
	last_seen: AtomicI64,
}

impl ClientHandle {
	pub fn new(id: ClientId, sender: mpsc::Sender<Message>) -> Arc<Self> {
		let color = color_for_client(id.as_str());
		Arc::new(Self {
			id,
			color,
			connected_at: Timestamp::now(),
			sender,
			kill: Notify::new(),
			last_seen: AtomicI64::new(Timestamp::now().0),
		})
	}

	/// Queue a frame without waiting. A full queue is backpressure, a closed
	/// one a dead socket; both mark the client for eviction.
	pub fn try_send(&self, msg: Message) -> CoResult<()> {
		self.sender.try_send(msg).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => Error::BackpressureExceeded,
			mpsc::error::TrySendError::Closed(_) => Error::SocketClosed,
		})
	}

	/// Record inbound activity for the liveness check.
	pub fn touch(&self) {
		self.last_seen.store(Timestamp::now().0, Ordering::Relaxed);
	}

	pub fn idle_secs(&self) -> i64 {
		Timestamp::now().0 - self.last_seen.load(Ordering::Relaxed)
	}

	/// Ask the owning connection task to shut down.
	pub fn evict(&self) {
		self.kill.notify_one();
	}

	pub async fn evicted(&self) {
		self.kill.notified().await;
	}
}

/// Per-room traffic counters for the stats task
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomTraffic {
	pub bytes_in: u64,
	pub bytes_out: u64,
}

pub struct Room {
	pub doc_id: String,
	clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
	bytes_in: AtomicU64,
	bytes_out: AtomicU64,
	/// Forwards model events (RPC-originated updates) into the room
	event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
	fn new(doc_id: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			doc_id: doc_id.into(),
			clients: RwLock::new(HashMap::new()),
			bytes_in: AtomicU64::new(0),
			bytes_out: AtomicU64::new(0),
			event_pump: Mutex::new(None),
		})
	}

	pub async fn client_count(&self) -> usize {
		self.clients.read().await.len()
	}

	pub async fn contains(&self, client_id: &ClientId) -> bool {
		self.clients.read().await.contains_key(client_id)
	}

	pub async fn client(&self, client_id: &ClientId) -> Option<Arc<ClientHandle>> {
		self.clients.read().await.get(client_id).cloned()
	}

	/// Snapshot copy of the current client set. Disconnects during iteration
	/// of the copy never invalidate a broadcast.
	pub async fn client_snapshot(&self) -> Vec<Arc<ClientHandle>> {
		self.clients.read().await.values().cloned().collect()
	}

	pub fn record_inbound(&self, bytes: usize) {
		self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
	}

	pub fn traffic(&self) -> RoomTraffic {
		RoomTraffic {
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
		}
	}

	/// Send a frame to every client except `skip`. Clients whose queue is
	/// full or closed are evicted after the sweep. Returns the number of
	/// clients that received the frame.
	pub async fn broadcast(&self, msg: &Message, skip: Option<&ClientId>) -> usize {
		let targets = self.client_snapshot().await;
		let frame_len = frame_size(msg) as u64;

		let mut delivered = 0;
		let mut failed: Vec<Arc<ClientHandle>> = Vec::new();
		for client in targets {
			if skip == Some(&client.id) {
				continue;
			}
			match client.try_send(msg.clone()) {
				Ok(()) => {
					delivered += 1;
					self.bytes_out.fetch_add(frame_len, Ordering::Relaxed);
				}
				Err(e) => {
					warn!("Dropping client {} from {}: {}", client.id, self.doc_id, e);
					failed.push(client);
				}
			}
		}

		// Removal happens after the sweep so iteration is never invalidated
		if !failed.is_empty() {
			let mut clients = self.clients.write().await;
			for client in failed {
				clients.remove(&client.id);
				client.evict();
			}
		}
		delivered
	}

	pub async fn broadcast_text(&self, msg: &WireMessage, skip: Option<&ClientId>) -> usize {
		match msg.to_json() {
			Ok(json) => self.broadcast(&Message::Text(json.into()), skip).await,
			Err(e) => {
				error!("Cannot serialize broadcast frame for {}: {}", self.doc_id, e);
				0
			}
		}
	}

	async fn stop_pump(&self) {
		if let Some(pump) = self.event_pump.lock().await.take() {
			pump.abort();
		}
	}
}

fn frame_size(msg: &Message) -> usize {
	match msg {
		Message::Text(text) => text.len(),
		Message::Binary(bytes) => bytes.len(),
		_ => 0,
	}
}

pub struct RoomManager {
	rooms: RwLock<HashMap<String, Arc<Room>>>,
	client_seq: AtomicU64,
}

impl RoomManager {
	pub fn new() -> Arc<Self> {
		Arc::new(Self { rooms: RwLock::new(HashMap::new()), client_seq: AtomicU64::new(0) })
	}

	/// Monotonic suffix plus a random salt, so ids stay unique across
	/// restarts without coordination.
	pub fn next_client_id(&self) -> ClientId {
		let seq = self.client_seq.fetch_add(1, Ordering::Relaxed) + 1;
		let salt: String = random_id().chars().take(6).collect();
		ClientId(format!("client-{}-{}", seq, salt).into())
	}

	pub async fn room(&self, doc_id: &str) -> Option<Arc<Room>> {
		self.rooms.read().await.get(doc_id).cloned()
	}

	pub async fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
		self.rooms.read().await.values().cloned().collect()
	}

	/// Register a client in the room for `doc_id`, creating the room if
	/// absent. The first join starts the room's model event pump.
	pub async fn join(
		&self,
		doc_id: &str,
		client: Arc<ClientHandle>,
		model: &Arc<DocumentModel>,
	) -> Arc<Room> {
		let room = {
			let mut rooms = self.rooms.write().await;
			rooms.entry(doc_id.to_string()).or_insert_with(|| Room::new(doc_id)).clone()
		};
		room.clients.write().await.insert(client.id.clone(), client);

		let mut pump = room.event_pump.lock().await;
		if pump.is_none() {
			*pump = Some(spawn_event_pump(room.clone(), model));
		}
		drop(pump);

		debug!("Client joined {} ({} clients)", doc_id, room.client_count().await);
		room
	}

	/// Remove a client; the room (and its event pump) goes away with the
	/// last member. The model may outlive the room pending autosave.
	pub async fn leave(&self, doc_id: &str, client_id: &ClientId) {
		let Some(room) = self.room(doc_id).await else { return };
		room.clients.write().await.remove(client_id);

		if room.client_count().await == 0 {
			let mut rooms = self.rooms.write().await;
			// Re-check under the map lock; someone may have joined meanwhile
			if let Some(candidate) = rooms.get(doc_id) {
				if candidate.client_count().await == 0 {
					candidate.stop_pump().await;
					rooms.remove(doc_id);
					debug!("Room {} destroyed", doc_id);
				}
			}
		}
	}
}

/// Forward `BroadcastNeeded` model events into the room.
///
/// Updates whose sender is a connected hub client were already relayed by
/// that client's receive loop and are skipped; everything else (command
/// interface edits carry the `server` sender id) goes to every client.
fn spawn_event_pump(room: Arc<Room>, model: &Arc<DocumentModel>) -> JoinHandle<()> {
	let mut events = model.subscribe();
	tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(ModelEvent::BroadcastNeeded { message, .. }) => {
					let sender_id = message
						.payload
						.get("senderId")
						.and_then(serde_json::Value::as_str)
						.map(|s| ClientId(s.into()));
					if let Some(sender_id) = &sender_id {
						if room.contains(sender_id).await {
							continue;
						}
					}
					room.broadcast_text(&message, None).await;
				}
				Ok(_) => {}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
					warn!("Event pump for {} lagged, {} events skipped", room.doc_id, missed);
				}
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			}
		}
	})
}


// vim: ts=4

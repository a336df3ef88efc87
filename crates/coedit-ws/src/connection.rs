//! WebSocket connection handling
//!
//! The collaboration protocol (`/<doc_id>`) serves one document per
//! connection. On accept the client gets a welcome frame with its id and
//! color, the full document snapshot and the current ephemeral blob; after
//! that every inbound frame is dispatched to the document model and the
//! resulting frames fan out through the room.
//!
//! Frames:
//! - binary: raw CRDT update bytes, rebroadcast verbatim
//! - text: JSON `{type, docId, ...}` (see `coedit_types::message`)

use axum::{
	extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
	extract::{Path, State},
	response::Response,
};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::prelude::*;
use crate::room::{ClientHandle, Room, RoomManager};
use coedit_model::{DocumentModel, HandleOutcome};
use coedit_registry::DocumentRegistry;
use coedit_types::config::Config;
use coedit_types::message::{self, WireMessage};

/// Outbound frames buffered per client before it counts as backpressured
const CLIENT_QUEUE_SIZE: usize = 256;

/// Shared state of the collaboration hub
#[derive(Clone)]
pub struct HubState {
	pub registry: Arc<DocumentRegistry>,
	pub rooms: Arc<RoomManager>,
	pub config: Arc<Config>,
}

/// Helper to close a WebSocket with an error code before the session starts
async fn close_with_error(mut socket: WebSocket, code: u16, reason: &'static str) {
	let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
	let _ = socket.close().await;
}

/// WebSocket upgrade handler for the collaboration protocol
///
/// Route: `/{doc_id}` - the first non-empty path segment is the document id.
pub async fn get_ws_collab(
	ws: WebSocketUpgrade,
	Path(doc_id): Path<String>,
	State(state): State<HubState>,
) -> Response {
	let doc_id = doc_id.trim_matches('/').to_string();
	debug!("WebSocket collab request for doc_id: {}", doc_id);

	ws.on_upgrade(move |socket| handle_collab_connection(socket, doc_id, state))
}

/// Handle one collaboration connection for its whole lifetime.
pub async fn handle_collab_connection(socket: WebSocket, doc_id: String, state: HubState) {
	let model = match state.registry.get_or_create(&doc_id).await {
		Ok(model) => model,
		Err(Error::InvalidInput(msg)) => {
			warn!("Rejecting connection, bad document id {}: {}", doc_id, msg);
			return close_with_error(socket, 4400, "Invalid document id").await;
		}
		Err(e) => {
			error!("Cannot open document {}: {}", doc_id, e);
			return close_with_error(socket, 4500, "Cannot open document").await;
		}
	};

	let client_id = state.rooms.next_client_id();
	info!("Client {} connected to document {}", client_id, doc_id);

	// Split the socket; outbound frames flow through a bounded queue drained
	// by a writer task, so broadcasts never block on this client's socket.
	let (mut ws_tx, mut ws_rx) = socket.split();
	let (sender, mut outbound) = mpsc::channel::<Message>(CLIENT_QUEUE_SIZE);

	let writer_client = client_id.clone();
	let writer_task = tokio::spawn(async move {
		while let Some(msg) = outbound.recv().await {
			if ws_tx.send(msg).await.is_err() {
				debug!("Socket closed while writing to {}", writer_client);
				break;
			}
		}
		let _ = ws_tx.close().await;
	});

	let client = ClientHandle::new(client_id.clone(), sender);
	let room = state.rooms.join(&doc_id, client.clone(), &model).await;

	// Bootstrap: welcome, full snapshot, current ephemeral state
	if let Err(e) = send_bootstrap(&client, &model, &doc_id).await {
		warn!("Bootstrap failed for {} on {}: {}", client_id, doc_id, e);
	}

	// Receive loop; ends on socket close, protocol shutdown or eviction
	loop {
		let frame = tokio::select! {
			frame = ws_rx.next() => frame,
			() = client.evicted() => {
				debug!("Client {} evicted from {}", client_id, doc_id);
				break;
			}
		};
		let Some(frame) = frame else { break };
		let frame = match frame {
			Ok(frame) => frame,
			Err(e) => {
				warn!("Connection error for {}: {}", client_id, e);
				break;
			}
		};

		client.touch();
		match frame {
			Message::Binary(bytes) => {
				room.record_inbound(bytes.len());
				if bytes.len() > state.config.max_frame_bytes {
					send_error(&client, &doc_id, &Error::FrameTooLarge);
					continue;
				}
				// Raw CRDT update: apply, then rebroadcast verbatim
				match model.apply_update(&bytes).await {
					Ok(()) => {
						let _ = model.advance_broadcast_vv().await;
						room.broadcast(&Message::Binary(bytes), Some(&client_id)).await;
					}
					Err(e) => send_error(&client, &doc_id, &e),
				}
			}
			Message::Text(text) => {
				room.record_inbound(text.len());
				if text.len() > state.config.max_frame_bytes {
					send_error(&client, &doc_id, &Error::FrameTooLarge);
					continue;
				}
				match WireMessage::from_json(&text) {
					Ok(msg) => {
						dispatch_frame(&room, &model, &client, &doc_id, msg).await;
					}
					Err(e) => send_error(&client, &doc_id, &e),
				}
			}
			Message::Ping(payload) => {
				let _ = client.try_send(Message::Pong(payload));
			}
			Message::Pong(_) => {}
			Message::Close(_) => break,
		}
	}

	// Disconnect cleanup: leave the room, prune ephemeral entries, tell the
	// remaining clients which presence entries disappeared.
	state.rooms.leave(&doc_id, &client_id).await;
	match model.on_client_disconnect(client_id.as_str()).await {
		Ok(removed) if !removed.is_empty() => {
			if let Some(room) = state.rooms.room(&doc_id).await {
				let blob = model.ephemeral_blob().await.ok().flatten().unwrap_or_default();
				let msg = WireMessage::ephemeral(&doc_id, &blob, Some(client_id.as_str()));
				room.broadcast_text(&msg, None).await;
			}
		}
		Ok(_) => {}
		Err(e) => warn!("Disconnect cleanup failed for {}: {}", client_id, e),
	}

	writer_task.abort();
	info!("Client {} disconnected from document {}", client_id, doc_id);
}

async fn send_bootstrap(
	client: &ClientHandle,
	model: &DocumentModel,
	doc_id: &str,
) -> CoResult<()> {
	let welcome = WireMessage::welcome(doc_id, client.id.as_str(), client.color);
	client.try_send(Message::Text(welcome.to_json()?.into()))?;

	let snapshot = model.get_snapshot().await?;
	let msg = WireMessage::snapshot(doc_id, &snapshot);
	client.try_send(Message::Text(msg.to_json()?.into()))?;

	if let Some(blob) = model.ephemeral_blob().await? {
		let msg = WireMessage::ephemeral(doc_id, &blob, None);
		client.try_send(Message::Text(msg.to_json()?.into()))?;
	}
	Ok(())
}

/// Dispatch one parsed JSON frame.
async fn dispatch_frame(
	room: &Arc<Room>,
	model: &Arc<DocumentModel>,
	client: &Arc<ClientHandle>,
	doc_id: &str,
	mut msg: WireMessage,
) {
	let client_id = client.id.clone();
	let result = match msg.msg_type.as_str() {
		message::MSG_QUERY_SNAPSHOT => {
			model.handle_message("snapshot-request", &msg, client_id.as_str()).await
		}
		message::MSG_SNAPSHOT | message::MSG_UPDATE | message::MSG_APPEND_PARAGRAPH
		| message::MSG_INSERT_PARAGRAPH => {
			let msg_type = msg.msg_type.clone();
			model.handle_message(&msg_type, &msg, client_id.as_str()).await
		}
		message::MSG_EPHEMERAL
		| message::MSG_QUERY_EPHEMERAL
		| message::MSG_CURSOR_POSITION
		| message::MSG_TEXT_SELECTION
		| message::MSG_AWARENESS_UPDATE => {
			// Presence payloads carry the sender's color for remote cursors
			if !msg.payload.contains_key("color") {
				msg.payload.insert("color".to_string(), Value::String(client.color.to_string()));
			}
			let kind = match msg.msg_type.as_str() {
				message::MSG_CURSOR_POSITION => "cursor",
				message::MSG_TEXT_SELECTION => "selection",
				message::MSG_AWARENESS_UPDATE => "awareness",
				message::MSG_QUERY_EPHEMERAL => "query",
				_ => "ephemeral",
			};
			model.handle_ephemeral(kind, &msg, client_id.as_str()).await
		}
		message::MSG_KEEPALIVE | message::MSG_PING => {
			let ack = WireMessage::keepalive_ack(doc_id, msg.payload.get("pingId"));
			Ok(HandleOutcome { reply: Some(ack), ..Default::default() })
		}
		other => {
			debug!("Unknown message type '{}' from {}", other, client_id);
			Err(Error::UnknownType(other.to_string()))
		}
	};

	match result {
		Ok(outcome) => {
			if let Some(reply) = outcome.reply {
				match reply.to_json() {
					Ok(json) => {
						if let Err(e) = client.try_send(Message::Text(json.into())) {
							warn!("Cannot reply to {}: {}", client_id, e);
						}
					}
					Err(e) => error!("Cannot serialize reply: {}", e),
				}
			}
			if let Some(broadcast) = outcome.broadcast {
				room.broadcast_text(&broadcast, Some(&client_id)).await;
			}
			if let Some(info) = outcome.document_info {
				debug!(
					"Document {}: {} blocks, {} changes",
					info.doc_id, info.total_blocks, info.version
				);
			}
		}
		Err(e) => {
			// Input and protocol errors go back to the sender; the
			// connection stays open.
			send_error(client, doc_id, &e);
		}
	}
}

fn send_error(client: &ClientHandle, doc_id: &str, error: &Error) {
	let msg = WireMessage::error(doc_id, error.reason());
	if let Ok(json) = msg.to_json() {
		let _ = client.try_send(Message::Text(json.into()));
	}
}

// vim: ts=4

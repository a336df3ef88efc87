//! Hub background tasks
//!
//! Liveness: a periodic sweep pings every connected client and evicts the
//! ones whose last activity is older than the configured timeout. Eviction
//! wakes the connection task, which runs the standard disconnect cleanup.
//!
//! Stats: a periodic log line per room with client count, traffic counters
//! and the model's dirty flag.

use std::time::Duration;

use axum::extract::ws::Message;
use tokio::task::JoinHandle;

use crate::connection::HubState;
use crate::prelude::*;

/// Stats lines are emitted once a minute
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the liveness sweep. Runs until the returned handle is aborted.
pub fn spawn_liveness(state: HubState) -> JoinHandle<()> {
	let interval = Duration::from_secs(state.config.client_ping_interval_sec.max(1));
	let timeout = state.config.client_ping_timeout_sec.max(1) as i64;

	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			ticker.tick().await;

			for room in state.rooms.rooms_snapshot().await {
				for client in room.client_snapshot().await {
					if client.idle_secs() > timeout {
						warn!(
							"Client {} in {} unresponsive for {}s, evicting",
							client.id,
							room.doc_id,
							client.idle_secs()
						);
						client.evict();
						continue;
					}
					// A failed ping marks the client; the broadcast path
					// removes it on the next sweep.
					if let Err(e) = client.try_send(Message::Ping(Vec::new().into())) {
						debug!("Ping failed for {}: {}", client.id, e);
						client.evict();
					}
				}
			}
		}
	})
}

/// Spawn the per-room statistics logger.
pub fn spawn_stats(state: HubState) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(STATS_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			ticker.tick().await;

			let rooms = state.rooms.rooms_snapshot().await;
			if rooms.is_empty() {
				continue;
			}
			for room in rooms {
				let traffic = room.traffic();
				let dirty = match state.registry.get(&room.doc_id).await {
					Some(model) => model.has_changed_since_last_save().await,
					None => false,
				};
				info!(
					"Room {}: {} clients, {} bytes in, {} bytes out, dirty={}",
					room.doc_id,
					room.client_count().await,
					traffic.bytes_in,
					traffic.bytes_out,
					dirty
				);
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::room::{ClientHandle, RoomManager};
	use std::sync::Arc;
	use coedit_model::DocumentModel;
	use coedit_registry::DocumentRegistry;
	use coedit_types::config::{Config, default_initial_state};
	use tokio::sync::mpsc;

	async fn hub_state() -> HubState {
		let config = Config { autosave_interval_sec: 0, ..Config::default() };
		HubState {
			registry: DocumentRegistry::new(config.clone()),
			rooms: RoomManager::new(),
			config: Arc::new(config),
		}
	}

	#[tokio::test]
	async fn test_liveness_evicts_idle_clients() {
		let state = hub_state().await;
		let model = Arc::new(DocumentModel::new("doc-idle", 64));
		model.initialize_from_lexical(&default_initial_state()).await.unwrap();

		let (tx, _rx) = mpsc::channel(8);
		let client = ClientHandle::new(state.rooms.next_client_id(), tx);
		state.rooms.join("doc-idle", client.clone(), &model).await;

		// Fresh client is not idle
		assert!(client.idle_secs() <= 1);

		// Eviction wakes whatever waits on the kill signal
		client.evict();
		tokio::time::timeout(Duration::from_millis(100), client.evicted())
			.await
			.unwrap();
	}
}

// vim: ts=4

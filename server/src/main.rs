//! Coedit server binary
//!
//! Wires the document registry, the WebSocket collaboration hub and the
//! command interface together. The hub and the command interface listen on
//! separate ports but share one registry, so command edits reach connected
//! editors through the same broadcast path as client edits.
//!
//! Configuration comes from the environment; see `load_config` for the
//! variables and their defaults.

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::{error, info};

use coedit_registry::DocumentRegistry;
use coedit_rpc::CommandService;
use coedit_types::config::Config;
use coedit_types::error::{CoResult, Error};
use coedit_ws::connection::HubState;
use coedit_ws::room::RoomManager;
use coedit_ws::{get_ws_collab, tasks};

fn env_string(key: &str, default: &str) -> String {
	std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
	match std::env::var(key) {
		Ok(value) => value.parse().unwrap_or(default),
		Err(_) => default,
	}
}

/// Build the runtime configuration from the environment.
///
/// | Variable | Default |
/// |----------|---------|
/// | `COEDIT_HOST` | `0.0.0.0` |
/// | `COEDIT_WS_PORT` | `8081` |
/// | `COEDIT_RPC_PORT` | `3001` |
/// | `COEDIT_DOCUMENTS_PATH` | `./documents` |
/// | `COEDIT_AUTOSAVE_SEC` | `30` (0 disables) |
/// | `COEDIT_SEED_FILE` | built-in seed state |
/// | `COEDIT_MAX_EPHEMERAL` | `64` |
/// | `COEDIT_PING_INTERVAL_SEC` | `30` |
/// | `COEDIT_PING_TIMEOUT_SEC` | `60` |
/// | `COEDIT_MAX_FRAME_BYTES` | `4194304` |
async fn load_config() -> CoResult<Config> {
	let defaults = Config::default();

	let initial_lexical_state = match std::env::var("COEDIT_SEED_FILE") {
		Ok(path) => {
			let content = tokio::fs::read_to_string(&path).await?;
			serde_json::from_str(&content)
				.map_err(|e| Error::CorruptPersisted(format!("{}: {}", path, e)))?
		}
		Err(_) => defaults.initial_lexical_state,
	};

	Ok(Config {
		bind_host: env_string("COEDIT_HOST", &defaults.bind_host).into(),
		bind_port: env_parse("COEDIT_WS_PORT", defaults.bind_port),
		rpc_port: env_parse("COEDIT_RPC_PORT", defaults.rpc_port),
		documents_path: env_string(
			"COEDIT_DOCUMENTS_PATH",
			&defaults.documents_path.to_string_lossy(),
		)
		.into(),
		autosave_interval_sec: env_parse("COEDIT_AUTOSAVE_SEC", defaults.autosave_interval_sec),
		initial_lexical_state,
		max_ephemeral_entries_per_doc: env_parse(
			"COEDIT_MAX_EPHEMERAL",
			defaults.max_ephemeral_entries_per_doc,
		),
		client_ping_interval_sec: env_parse(
			"COEDIT_PING_INTERVAL_SEC",
			defaults.client_ping_interval_sec,
		),
		client_ping_timeout_sec: env_parse(
			"COEDIT_PING_TIMEOUT_SEC",
			defaults.client_ping_timeout_sec,
		),
		max_frame_bytes: env_parse("COEDIT_MAX_FRAME_BYTES", defaults.max_frame_bytes),
	})
}

async fn run() -> CoResult<()> {
	let config = load_config().await?;
	info!("Coedit server v{}", env!("CARGO_PKG_VERSION"));
	info!("Documents path: {}", config.documents_path.display());

	tokio::fs::create_dir_all(&config.documents_path).await.map_err(|e| {
		error!("FATAL: Cannot create documents dir: {}", e);
		Error::WriteFailed(format!("cannot create documents dir: {}", e))
	})?;

	let registry = DocumentRegistry::new(config.clone());
	registry.start_autosave();

	let hub_state = HubState {
		registry: registry.clone(),
		rooms: RoomManager::new(),
		config: Arc::new(config.clone()),
	};
	let liveness = tasks::spawn_liveness(hub_state.clone());
	let stats = tasks::spawn_stats(hub_state.clone());

	let hub_router = axum::Router::new()
		.route("/{doc_id}", axum::routing::any(get_ws_collab))
		.layer(TraceLayer::new_for_http())
		.with_state(hub_state);

	let command_service = CommandService::new(registry.clone());
	let rpc_router = coedit_rpc::router(command_service).layer(TraceLayer::new_for_http());

	let hub_addr = format!("{}:{}", config.bind_host, config.bind_port);
	let rpc_addr = format!("{}:{}", config.bind_host, config.rpc_port);

	let hub_listener = tokio::net::TcpListener::bind(&hub_addr).await?;
	let rpc_listener = tokio::net::TcpListener::bind(&rpc_addr).await?;
	info!("Collaboration hub listening on ws://{}/<doc_id>", hub_addr);
	info!("Command interface listening on http://{}", rpc_addr);

	let hub_server = tokio::spawn(async move { axum::serve(hub_listener, hub_router).await });
	let rpc_server = tokio::spawn(async move { axum::serve(rpc_listener, rpc_router).await });

	tokio::signal::ctrl_c().await?;
	info!("Shutdown requested");

	liveness.abort();
	stats.abort();
	hub_server.abort();
	rpc_server.abort();

	// Flush every dirty document before the process goes away
	registry.shutdown().await;
	info!("Bye");
	Ok(())
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_target(false)
		.init();

	if let Err(e) = run().await {
		error!("FATAL: {}", e);
		std::process::exit(1);
	}
}

// vim: ts=4

//! Runtime configuration
//!
//! Options are populated from the environment by the server binary; library
//! crates only ever see the resolved struct.

use std::path::PathBuf;

use serde_json::{Value, json};

/// Seed state for fresh documents: one heading and one empty-ish paragraph,
/// mirroring the default the editor ships with.
pub fn default_initial_state() -> Value {
	json!({
		"root": {
			"type": "root",
			"direction": null,
			"format": "",
			"indent": 0,
			"version": 1,
			"children": [
				{
					"type": "heading",
					"tag": "h1",
					"direction": null,
					"format": "",
					"indent": 0,
					"version": 1,
					"children": [
						{
							"type": "text",
							"text": "Lexical with Loro",
							"detail": 0,
							"format": 0,
							"mode": "normal",
							"style": "",
							"version": 1
						}
					]
				},
				{
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
							"text": "Type something...",
							"detail": 0,
							"format": 0,
							"mode": "normal",
							"style": "",
							"version": 1
						}
					]
				}
			]
		}
	})
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind_host: Box<str>,
	/// WebSocket hub port
	pub bind_port: u16,
	/// Command (RPC) interface port
	pub rpc_port: u16,
	pub documents_path: PathBuf,
	/// Seconds between autosave sweeps; 0 disables autosave
	pub autosave_interval_sec: u64,
	/// Lexical state used to seed documents that have no persisted file
	pub initial_lexical_state: Value,
	pub max_ephemeral_entries_per_doc: usize,
	pub client_ping_interval_sec: u64,
	pub client_ping_timeout_sec: u64,
	/// Frames larger than this are rejected with `FrameTooLarge`
	pub max_frame_bytes: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind_host: "0.0.0.0".into(),
			bind_port: 8081,
			rpc_port: 3001,
			documents_path: PathBuf::from("./documents"),
			autosave_interval_sec: 30,
			initial_lexical_state: default_initial_state(),
			max_ephemeral_entries_per_doc: 64,
			client_ping_interval_sec: 30,
			client_ping_timeout_sec: 60,
			max_frame_bytes: 4 * 1024 * 1024,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_initial_state_is_valid_lexical() {
		let state = default_initial_state();
		assert_eq!(state["root"]["type"], "root");

		let children = state["root"]["children"].as_array().unwrap();
		assert_eq!(children.len(), 2);
		assert_eq!(children[0]["type"], "heading");
		assert_eq!(children[1]["type"], "paragraph");
	}
}

// vim: ts=4

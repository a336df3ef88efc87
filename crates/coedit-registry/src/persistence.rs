//! File persistence for documents
//!
//! One file per document at `<base>/<doc_id>.json`, human-readable Lexical
//! JSON. Writes go through a temp file, fsync and rename, so a crash can
//! never leave a half-written document behind. Malformed files are surfaced
//! as `CorruptPersisted` and never silently overwritten.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::prelude::*;

pub fn document_path(base: &Path, doc_id: &str) -> PathBuf {
	base.join(format!("{}.json", doc_id))
}

/// Document ids become file names, so they are restricted to a safe alphabet.
pub fn validate_doc_id(doc_id: &str) -> CoResult<()> {
	if doc_id.is_empty() || doc_id.len() > 128 {
		return Err(Error::InvalidInput("document id must be 1-128 characters".into()));
	}
	if doc_id.starts_with('.')
		|| !doc_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
	{
		return Err(Error::InvalidInput(format!("invalid document id: {}", doc_id)));
	}
	Ok(())
}

/// Load a persisted document. Absent files map to `NotFound`.
pub async fn load_document(base: &Path, doc_id: &str) -> CoResult<Value> {
	let path = document_path(base, doc_id);
	let content = tokio::fs::read_to_string(&path).await?;

	let state: Value = serde_json::from_str(&content)
		.map_err(|e| Error::CorruptPersisted(format!("{}: {}", path.display(), e)))?;
	if state["root"]["type"] != "root" {
		return Err(Error::CorruptPersisted(format!(
			"{}: missing root node of type 'root'",
			path.display()
		)));
	}
	Ok(state)
}

/// Atomically persist a document: write `<doc_id>.json.tmp`, fsync, rename.
pub async fn save_document(base: &Path, doc_id: &str, state: &Value) -> CoResult<()> {
	tokio::fs::create_dir_all(base)
		.await
		.map_err(|e| Error::WriteFailed(format!("cannot create {}: {}", base.display(), e)))?;

	let path = document_path(base, doc_id);
	let tmp_path = base.join(format!("{}.json.tmp", doc_id));

	let content = serde_json::to_string_pretty(state)?;

	let mut file = tokio::fs::File::create(&tmp_path)
		.await
		.map_err(|e| Error::WriteFailed(format!("{}: {}", tmp_path.display(), e)))?;
	file.write_all(content.as_bytes())
		.await
		.map_err(|e| Error::WriteFailed(format!("{}: {}", tmp_path.display(), e)))?;
	file.sync_all()
		.await
		.map_err(|e| Error::WriteFailed(format!("{}: {}", tmp_path.display(), e)))?;
	drop(file);

	tokio::fs::rename(&tmp_path, &path)
		.await
		.map_err(|e| Error::WriteFailed(format!("{}: {}", path.display(), e)))?;

	debug!("Persisted document {} ({} bytes)", doc_id, content.len());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tempfile::TempDir;

	#[test]
	fn test_validate_doc_id() {
		assert!(validate_doc_id("doc-A_1.v2").is_ok());
		assert!(validate_doc_id("").is_err());
		assert!(validate_doc_id("../etc/passwd").is_err());
		assert!(validate_doc_id("a/b").is_err());
		assert!(validate_doc_id(".hidden").is_err());
	}

	#[tokio::test]
	async fn test_save_and_load_roundtrip() {
		let dir = TempDir::new().unwrap();
		let state = json!({ "root": { "type": "root", "children": [] } });

		save_document(dir.path(), "doc-a", &state).await.unwrap();
		let loaded = load_document(dir.path(), "doc-a").await.unwrap();
		assert_eq!(loaded, state);

		// No stale temp file left behind
		assert!(!dir.path().join("doc-a.json.tmp").exists());
	}

	#[tokio::test]
	async fn test_load_absent_is_not_found() {
		let dir = TempDir::new().unwrap();
		assert!(matches!(load_document(dir.path(), "missing").await, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn test_load_malformed_is_corrupt() {
		let dir = TempDir::new().unwrap();
		tokio::fs::write(dir.path().join("bad.json"), "{not json").await.unwrap();
		assert!(matches!(
			load_document(dir.path(), "bad").await,
			Err(Error::CorruptPersisted(_))
		));
	}

	#[tokio::test]
	async fn test_load_wrong_root_is_corrupt() {
		let dir = TempDir::new().unwrap();
		tokio::fs::write(dir.path().join("odd.json"), r#"{"root":{"type":"paragraph"}}"#)
			.await
			.unwrap();
		assert!(matches!(
			load_document(dir.path(), "odd").await,
			Err(Error::CorruptPersisted(_))
		));
	}
}

// vim: ts=4

//! Command service
//!
//! The service is the transport-independent core of the command interface;
//! the axum handlers in [`crate::handler`] are thin wrappers around it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::prelude::*;
use coedit_model::model::SERVER_SENDER_ID;
use coedit_registry::DocumentRegistry;
use coedit_types::types::DocumentInfo;

#[derive(Debug, Serialize)]
pub struct LoadDocumentResponse {
	pub success: bool,
	#[serde(rename = "docId")]
	pub doc_id: String,
	#[serde(rename = "lexicalState")]
	pub lexical_state: Value,
	#[serde(rename = "containerId")]
	pub container_id: String,
}

#[derive(Debug, Serialize)]
pub struct SetCurrentDocumentResponse {
	pub success: bool,
	#[serde(rename = "docId")]
	pub doc_id: String,
	#[serde(rename = "containerId")]
	pub container_id: String,
}

#[derive(Debug, Serialize)]
pub struct ParagraphResponse {
	pub success: bool,
	#[serde(rename = "docId")]
	pub doc_id: String,
	pub action: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub index: Option<usize>,
	pub text: String,
	#[serde(rename = "totalBlocks")]
	pub total_blocks: usize,
}

pub struct CommandService {
	registry: Arc<DocumentRegistry>,
	current_doc: RwLock<Option<String>>,
}

impl CommandService {
	pub fn new(registry: Arc<DocumentRegistry>) -> Arc<Self> {
		Arc::new(Self { registry, current_doc: RwLock::new(None) })
	}

	/// Explicit ids win; otherwise the current document is used.
	async fn resolve_doc_id(&self, doc_id: Option<String>) -> CoResult<String> {
		if let Some(doc_id) = doc_id {
			return Ok(doc_id);
		}
		self.current_doc.read().await.clone().ok_or(Error::NoCurrentDocument)
	}

	pub async fn current_document(&self) -> Option<String> {
		self.current_doc.read().await.clone()
	}

	/// Load a document (creating it if absent) and return its full state.
	pub async fn load_document(&self, doc_id: &str) -> CoResult<LoadDocumentResponse> {
		info!("Loading document: {}", doc_id);
		let model = self.registry.get_or_create(doc_id).await?;
		let lexical_state = model.export_lexical().await?;
		let info = model.document_info().await?;

		Ok(LoadDocumentResponse {
			success: true,
			doc_id: doc_id.to_string(),
			lexical_state,
			container_id: info.container_id,
		})
	}

	/// Establish the working document used by verbs without an explicit id.
	pub async fn set_current_document(&self, doc_id: &str) -> CoResult<SetCurrentDocumentResponse> {
		let model = self.registry.get_or_create(doc_id).await?;
		let info = model.document_info().await?;

		*self.current_doc.write().await = Some(doc_id.to_string());
		info!("Current document set to {}", doc_id);

		Ok(SetCurrentDocumentResponse {
			success: true,
			doc_id: doc_id.to_string(),
			container_id: info.container_id,
		})
	}

	/// Append a paragraph at the end of the document.
	pub async fn append_paragraph(
		&self,
		text: &str,
		doc_id: Option<String>,
	) -> CoResult<ParagraphResponse> {
		let doc_id = self.resolve_doc_id(doc_id).await?;
		let model = self.registry.get_or_create(&doc_id).await?;

		let (_, total_blocks) = model.append_paragraph(text).await?;
		// Hand the delta to hub subscribers as a server-originated update
		model.broadcast_pending_update(SERVER_SENDER_ID).await?;
		debug!("Appended paragraph to {} ({} blocks)", doc_id, total_blocks);

		Ok(ParagraphResponse {
			success: true,
			doc_id,
			action: "append_paragraph",
			index: None,
			text: text.to_string(),
			total_blocks,
		})
	}

	/// Insert a paragraph at `index`; an index beyond the end appends.
	pub async fn insert_paragraph(
		&self,
		index: usize,
		text: &str,
		doc_id: Option<String>,
	) -> CoResult<ParagraphResponse> {
		let doc_id = self.resolve_doc_id(doc_id).await?;
		let model = self.registry.get_or_create(&doc_id).await?;

		let (_, actual_index, total_blocks) = model.insert_paragraph(index, text).await?;
		model.broadcast_pending_update(SERVER_SENDER_ID).await?;
		debug!("Inserted paragraph into {} at {} ({} blocks)", doc_id, actual_index, total_blocks);

		Ok(ParagraphResponse {
			success: true,
			doc_id,
			action: "insert_paragraph",
			index: Some(actual_index),
			text: text.to_string(),
			total_blocks,
		})
	}

	/// Summary of a document's structure and persistence state.
	pub async fn get_document_info(&self, doc_id: Option<String>) -> CoResult<DocumentInfo> {
		let doc_id = self.resolve_doc_id(doc_id).await?;
		let model = self.registry.get_or_create(&doc_id).await?;
		model.document_info().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use coedit_types::config::Config;
	use tempfile::TempDir;

	fn service(dir: &TempDir) -> Arc<CommandService> {
		let config = Config {
			documents_path: dir.path().to_path_buf(),
			autosave_interval_sec: 0,
			..Config::default()
		};
		CommandService::new(DocumentRegistry::new(config))
	}

	#[tokio::test]
	async fn test_load_document_creates_and_returns_state() {
		let dir = TempDir::new().unwrap();
		let svc = service(&dir);

		let resp = svc.load_document("doc-rpc").await.unwrap();
		assert!(resp.success);
		assert_eq!(resp.lexical_state["root"]["type"], "root");
		assert!(!resp.container_id.is_empty());
	}

	#[tokio::test]
	async fn test_no_current_document_error() {
		let dir = TempDir::new().unwrap();
		let svc = service(&dir);

		assert!(matches!(
			svc.append_paragraph("x", None).await,
			Err(Error::NoCurrentDocument)
		));
	}

	#[tokio::test]
	async fn test_explicit_doc_id_wins_over_current() {
		let dir = TempDir::new().unwrap();
		let svc = service(&dir);

		svc.set_current_document("doc-current").await.unwrap();
		let resp = svc.append_paragraph("x", Some("doc-explicit".into())).await.unwrap();
		assert_eq!(resp.doc_id, "doc-explicit");

		let resp = svc.append_paragraph("y", None).await.unwrap();
		assert_eq!(resp.doc_id, "doc-current");
	}

	#[tokio::test]
	async fn test_append_and_insert_update_block_counts() {
		let dir = TempDir::new().unwrap();
		let svc = service(&dir);
		svc.set_current_document("doc-blocks").await.unwrap();

		// The seed carries two blocks
		let resp = svc.append_paragraph("third", None).await.unwrap();
		assert_eq!(resp.total_blocks, 3);

		let resp = svc.insert_paragraph(1, "second", None).await.unwrap();
		assert_eq!(resp.total_blocks, 4);
		assert_eq!(resp.index, Some(1));

		// An index beyond the end appends
		let resp = svc.insert_paragraph(99, "last", None).await.unwrap();
		assert_eq!(resp.index, Some(4));
		assert_eq!(resp.total_blocks, 5);
	}

	#[tokio::test]
	async fn test_get_document_info_reports_structure() {
		let dir = TempDir::new().unwrap();
		let svc = service(&dir);

		let info = svc.get_document_info(Some("doc-info".into())).await.unwrap();
		assert_eq!(info.doc_id, "doc-info");
		assert_eq!(info.total_blocks, 2);
		assert_eq!(info.block_types.get("heading"), Some(&1));
		assert!(info.initialized);
	}
}

// vim: ts=4

//! Command interface HTTP handlers

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;

use crate::prelude::*;
use crate::service::{
	CommandService, LoadDocumentResponse, ParagraphResponse, SetCurrentDocumentResponse,
};
use coedit_types::types::DocumentInfo;

/// Request body for verbs that require a document id
#[derive(Debug, Deserialize)]
pub struct DocumentRequest {
	#[serde(rename = "docId")]
	pub doc_id: String,
}

/// Request body for verbs where the document id may fall back to the
/// current document
#[derive(Debug, Deserialize)]
pub struct OptionalDocumentRequest {
	#[serde(rename = "docId")]
	pub doc_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppendParagraphRequest {
	pub text: String,
	#[serde(rename = "docId")]
	pub doc_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InsertParagraphRequest {
	pub index: usize,
	pub text: String,
	#[serde(rename = "docId")]
	pub doc_id: Option<String>,
}

/// POST /api/rpc/load-document
///
/// Loads a document, creating it from the configured seed state if absent.
pub async fn post_load_document(
	State(service): State<Arc<CommandService>>,
	Json(body): Json<DocumentRequest>,
) -> CoResult<Json<LoadDocumentResponse>> {
	Ok(Json(service.load_document(&body.doc_id).await?))
}

/// POST /api/rpc/set-current-document
pub async fn post_set_current_document(
	State(service): State<Arc<CommandService>>,
	Json(body): Json<DocumentRequest>,
) -> CoResult<Json<SetCurrentDocumentResponse>> {
	Ok(Json(service.set_current_document(&body.doc_id).await?))
}

/// POST /api/rpc/append-paragraph
pub async fn post_append_paragraph(
	State(service): State<Arc<CommandService>>,
	Json(body): Json<AppendParagraphRequest>,
) -> CoResult<Json<ParagraphResponse>> {
	Ok(Json(service.append_paragraph(&body.text, body.doc_id).await?))
}

/// POST /api/rpc/insert-paragraph
pub async fn post_insert_paragraph(
	State(service): State<Arc<CommandService>>,
	Json(body): Json<InsertParagraphRequest>,
) -> CoResult<Json<ParagraphResponse>> {
	Ok(Json(service.insert_paragraph(body.index, &body.text, body.doc_id).await?))
}

/// POST /api/rpc/get-document-info
pub async fn post_get_document_info(
	State(service): State<Arc<CommandService>>,
	Json(body): Json<OptionalDocumentRequest>,
) -> CoResult<Json<DocumentInfo>> {
	Ok(Json(service.get_document_info(body.doc_id).await?))
}

/// Build the command interface router.
pub fn router(service: Arc<CommandService>) -> Router {
	debug!("Initializing command interface routes");
	Router::new()
		.route("/api/rpc/load-document", post(post_load_document))
		.route("/api/rpc/set-current-document", post(post_set_current_document))
		.route("/api/rpc/append-paragraph", post(post_append_paragraph))
		.route("/api/rpc/insert-paragraph", post(post_insert_paragraph))
		.route("/api/rpc/get-document-info", post(post_get_document_info))
		.with_state(service)
}

// vim: ts=4

//! Registry of live document models
//!
//! The `documents` map lock is held only for lookup/insert/remove, never
//! across model operations or file I/O. Lock order everywhere in the
//! workspace is: registry map -> model mutex -> room lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::persistence;
use crate::prelude::*;
use coedit_model::DocumentModel;
use coedit_model::model::content_hash_of;
use coedit_types::config::Config;

/// A save that does not finish within this window is logged as failed and
/// retried on the next autosave tick.
const SAVE_TIMEOUT: Duration = Duration::from_secs(10);

struct AutosaveTask {
	stop: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

pub struct DocumentRegistry {
	config: Config,
	documents: RwLock<HashMap<String, Arc<DocumentModel>>>,
	autosave: Mutex<Option<AutosaveTask>>,
}

impl DocumentRegistry {
	pub fn new(config: Config) -> Arc<Self> {
		Arc::new(Self {
			config,
			documents: RwLock::new(HashMap::new()),
			autosave: Mutex::new(None),
		})
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Fetch a live model without creating one.
	pub async fn get(&self, doc_id: &str) -> Option<Arc<DocumentModel>> {
		self.documents.read().await.get(doc_id).cloned()
	}

	/// Ids of all live models.
	pub async fn document_ids(&self) -> Vec<String> {
		self.documents.read().await.keys().cloned().collect()
	}

	/// Get the model for `doc_id`, creating it on first reference.
	///
	/// A fresh model is loaded from `<base>/<doc_id>.json` when present,
	/// otherwise seeded from the configured initial Lexical state. A
	/// poisoned model is evicted here and replaced by a reload of the last
	/// persisted state.
	pub async fn get_or_create(&self, doc_id: &str) -> CoResult<Arc<DocumentModel>> {
		persistence::validate_doc_id(doc_id)?;

		if let Some(model) = self.get(doc_id).await {
			if !model.is_poisoned() {
				return Ok(model);
			}
			warn!("Evicting poisoned model for document {}", doc_id);
			self.documents.write().await.remove(doc_id);
		}

		// Build and initialize outside the map lock; only the winner of the
		// final insert race is kept, so two models never share a document.
		let model = Arc::new(DocumentModel::new(
			doc_id,
			self.config.max_ephemeral_entries_per_doc,
		));
		match persistence::load_document(&self.config.documents_path, doc_id).await {
			Ok(state) => {
				model.initialize_from_lexical(&state).await?;
				// Loaded content equals the file content; not dirty yet
				model.mark_saved(content_hash_of(&state)).await?;
				debug!("Loaded document {} from disk", doc_id);
			}
			Err(Error::NotFound) => {
				model.initialize_from_lexical(&self.config.initial_lexical_state).await?;
				info!("Seeded new document {}", doc_id);
			}
			Err(e) => return Err(e),
		}

		let mut documents = self.documents.write().await;
		if let Some(existing) = documents.get(doc_id) {
			if !existing.is_poisoned() {
				return Ok(existing.clone());
			}
		}
		documents.insert(doc_id.to_string(), model.clone());
		Ok(model)
	}

	/// Export and persist one document, then record its content hash.
	pub async fn save(&self, doc_id: &str) -> CoResult<()> {
		let model = self.get(doc_id).await.ok_or(Error::NotFound)?;
		let (state, hash) = model.export_for_save().await?;
		persistence::save_document(&self.config.documents_path, doc_id, &state).await?;
		model.mark_saved(hash).await?;
		Ok(())
	}

	/// Save every dirty document; clean ones are skipped entirely.
	/// Returns the per-document outcome for the documents that were saved.
	pub async fn save_all(&self) -> Vec<(String, CoResult<()>)> {
		let models: Vec<(String, Arc<DocumentModel>)> = {
			let documents = self.documents.read().await;
			documents.iter().map(|(id, model)| (id.clone(), model.clone())).collect()
		};

		let mut outcomes = Vec::new();
		for (doc_id, model) in models {
			if !model.has_changed_since_last_save().await {
				continue;
			}
			let result = match tokio::time::timeout(SAVE_TIMEOUT, self.save(&doc_id)).await {
				Ok(result) => result,
				Err(elapsed) => Err(elapsed.into()),
			};
			if let Err(e) = &result {
				warn!("Autosave failed for document {}: {}", doc_id, e);
			}
			outcomes.push((doc_id, result));
		}
		outcomes
	}

	/// Start the periodic autosave sweep. A zero interval disables it.
	/// At most one sweep runs at a time.
	pub fn start_autosave(self: &Arc<Self>) {
		let interval_sec = self.config.autosave_interval_sec;
		if interval_sec == 0 {
			info!("Autosave disabled by configuration");
			return;
		}

		let (stop, mut stopped) = watch::channel(false);
		let registry = Arc::clone(self);
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(interval_sec));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			// The first tick fires immediately; it persists freshly seeded
			// documents right away.
			loop {
				tokio::select! {
					_ = interval.tick() => {
						let outcomes = registry.save_all().await;
						if !outcomes.is_empty() {
							let summary = outcomes
								.iter()
								.map(|(id, result)| match result {
									Ok(()) => format!("{}: ok", id),
									Err(e) => format!("{}: {}", id, e),
								})
								.join(", ");
							info!("Autosave sweep: {}", summary);
						}
					}
					_ = stopped.changed() => break,
				}
			}
		});

		if let Ok(mut autosave) = self.autosave.try_lock() {
			*autosave = Some(AutosaveTask { stop, handle });
		}
	}

	/// Stop autosave, flush every dirty document once more, drop all models.
	/// Data written before shutdown was requested is never lost.
	pub async fn shutdown(&self) {
		let task = self.autosave.lock().await.take();
		if let Some(task) = task {
			let _ = task.stop.send(true);
			if let Err(e) = task.handle.await {
				warn!("Autosave task ended abnormally: {}", e);
			}
		}

		let outcomes = self.save_all().await;
		let failed = outcomes.iter().filter(|(_, result)| result.is_err()).count();
		if failed > 0 {
			error!("Shutdown flush: {} of {} saves failed", failed, outcomes.len());
		} else {
			info!("Shutdown flush complete ({} documents saved)", outcomes.len());
		}

		self.documents.write().await.clear();
	}
}


// vim: ts=4

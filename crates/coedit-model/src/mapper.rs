//! Lexical key / tree id mapping
//!
//! The mapper is a pure lookup aid: the tree owns structure and identity,
//! the mapper only answers "which tree node does this lexical key name" and
//! the reverse, in O(1). It is rebuilt from a full tree walk after every
//! import and extended on each newly created node.

use std::collections::HashMap;

use loro::{LoroTree, TreeID};

use crate::converter;
use crate::prelude::*;
use coedit_types::utils::random_lexical_key;

#[derive(Debug, Default)]
pub struct NodeMapper {
	by_key: HashMap<String, TreeID>,
	by_id: HashMap<TreeID, String>,
}

impl NodeMapper {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bind a lexical key to a tree id. Both sides must be unbound.
	pub fn create(&mut self, lexical_key: impl Into<String>, tree_id: TreeID) -> CoResult<()> {
		let lexical_key = lexical_key.into();
		if self.by_key.contains_key(&lexical_key) {
			return Err(Error::DuplicateMapping(format!("key already bound: {}", lexical_key)));
		}
		if self.by_id.contains_key(&tree_id) {
			return Err(Error::DuplicateMapping(format!(
				"tree id already bound: {}",
				converter::tree_id_str(tree_id)
			)));
		}
		self.by_id.insert(tree_id, lexical_key.clone());
		self.by_key.insert(lexical_key, tree_id);
		Ok(())
	}

	pub fn lookup_by_key(&self, lexical_key: &str) -> Option<TreeID> {
		self.by_key.get(lexical_key).copied()
	}

	pub fn lookup_by_id(&self, tree_id: TreeID) -> Option<&str> {
		self.by_id.get(&tree_id).map(String::as_str)
	}

	/// Remove the binding for a lexical key, returning the freed tree id.
	pub fn remove_by_key(&mut self, lexical_key: &str) -> Option<TreeID> {
		let tree_id = self.by_key.remove(lexical_key)?;
		self.by_id.remove(&tree_id);
		Some(tree_id)
	}

	/// Remove the binding for a tree id, returning the freed lexical key.
	pub fn remove_by_id(&mut self, tree_id: TreeID) -> Option<String> {
		let lexical_key = self.by_id.remove(&tree_id)?;
		self.by_key.remove(&lexical_key);
		Some(lexical_key)
	}

	pub fn clear(&mut self) {
		self.by_key.clear();
		self.by_id.clear();
	}

	pub fn len(&self) -> usize {
		self.by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_id.is_empty()
	}

	/// Rebuild the tables from a full tree walk.
	///
	/// Nodes that disappeared from the tree lose their binding; live nodes
	/// without one get a fresh key. Existing bindings keep their keys so
	/// handles held by callers stay valid across imports.
	pub fn sync_existing(&mut self, tree: &LoroTree) -> CoResult<()> {
		let live = tree.nodes();

		self.by_key.retain(|_, tree_id| live.contains(tree_id));
		self.by_id.retain(|tree_id, _| live.contains(tree_id));

		for tree_id in live {
			if !self.by_id.contains_key(&tree_id) {
				self.create(random_lexical_key(), tree_id)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loro::{LoroDoc, TreeParentId};

	fn tree_with_nodes(count: usize) -> (LoroDoc, Vec<TreeID>) {
		let doc = LoroDoc::new();
		let tree = doc.get_tree("lexical");
		let root = tree.create(TreeParentId::Root).unwrap();
		let mut ids = vec![root];
		for i in 0..count.saturating_sub(1) {
			ids.push(tree.create_at(TreeParentId::Node(root), i).unwrap());
		}
		(doc, ids)
	}

	#[test]
	fn test_create_and_lookup() {
		let (_doc, ids) = tree_with_nodes(2);
		let mut mapper = NodeMapper::new();

		mapper.create("rootKey", ids[0]).unwrap();
		assert_eq!(mapper.lookup_by_key("rootKey"), Some(ids[0]));
		assert_eq!(mapper.lookup_by_id(ids[0]), Some("rootKey"));
		assert_eq!(mapper.lookup_by_key("missing"), None);
	}

	#[test]
	fn test_duplicate_mapping_rejected() {
		let (_doc, ids) = tree_with_nodes(2);
		let mut mapper = NodeMapper::new();

		mapper.create("a", ids[0]).unwrap();
		assert!(matches!(mapper.create("a", ids[1]), Err(Error::DuplicateMapping(_))));
		assert!(matches!(mapper.create("b", ids[0]), Err(Error::DuplicateMapping(_))));
	}

	#[test]
	fn test_remove_clears_both_sides() {
		let (_doc, ids) = tree_with_nodes(1);
		let mut mapper = NodeMapper::new();

		mapper.create("k", ids[0]).unwrap();
		assert_eq!(mapper.remove_by_key("k"), Some(ids[0]));
		assert_eq!(mapper.lookup_by_id(ids[0]), None);
		assert!(mapper.is_empty());
	}

	#[test]
	fn test_sync_existing_generates_missing_keys() {
		let (doc, ids) = tree_with_nodes(3);
		let tree = doc.get_tree("lexical");
		let mut mapper = NodeMapper::new();

		mapper.create("kept", ids[0]).unwrap();
		mapper.sync_existing(&tree).unwrap();

		assert_eq!(mapper.len(), 3);
		// Pre-existing binding survives the walk
		assert_eq!(mapper.lookup_by_key("kept"), Some(ids[0]));
		for id in &ids[1..] {
			assert!(mapper.lookup_by_id(*id).is_some());
		}
	}

	#[test]
	fn test_sync_existing_drops_dead_nodes() {
		let (doc, ids) = tree_with_nodes(2);
		let tree = doc.get_tree("lexical");
		let mut mapper = NodeMapper::new();
		mapper.sync_existing(&tree).unwrap();
		assert_eq!(mapper.len(), 2);

		tree.delete(ids[1]).unwrap();
		mapper.sync_existing(&tree).unwrap();
		assert_eq!(mapper.len(), 1);
		assert_eq!(mapper.lookup_by_id(ids[1]), None);
	}
}

// vim: ts=4

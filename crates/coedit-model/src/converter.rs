//! Bidirectional conversion between Lexical JSON and the Loro tree
//!
//! Lexical JSON is the persistence and editor-facing format; the tree is the
//! runtime format and the source of truth for order and identity. Key fields
//! (`__key`, `key`, `lexicalKey`) are stripped on import and regenerated on
//! every export, so the tree id is the only durable identity a node has.
//!
//! Tree layout per node:
//! - `elementType`: the Lexical schema discriminant (`root`, `paragraph`, ...)
//! - `lexical`: the node's remaining fields, minus `children` and key fields

use std::collections::BTreeMap;

use loro::{LoroTree, LoroValue, TreeID, TreeParentId, ValueOrContainer};
use serde_json::{Map, Value};

use crate::prelude::*;
use crate::value::{json_from_loro_value, loro_value_from_json};
use coedit_types::utils::random_lexical_key;

pub const META_ELEMENT_TYPE: &str = "elementType";
pub const META_LEXICAL: &str = "lexical";

/// Fields that never enter the tree: structure lives in the tree itself and
/// keys are regenerated on export.
const STRIPPED_FIELDS: [&str; 4] = ["children", "__key", "key", "lexicalKey"];

/// Render a tree id in its canonical `counter@peer` form for logs and events.
pub fn tree_id_str(id: TreeID) -> String {
	format!("{}@{}", id.counter, id.peer)
}

/// Children of a node in CRDT sibling order.
pub fn children_of(tree: &LoroTree, parent: TreeID) -> Vec<TreeID> {
	tree.children(TreeParentId::Node(parent)).unwrap_or_default()
}

/// Locate the unique parentless node.
pub fn find_root(tree: &LoroTree) -> Option<TreeID> {
	tree.roots().first().copied()
}

/// Import a Lexical state into the tree, replacing its whole content.
///
/// Returns the id of the newly created root node. Sibling order in the tree
/// equals array order in the source.
pub fn import_from_lexical(tree: &LoroTree, state: &Value) -> CoResult<TreeID> {
	let root_data = state
		.get("root")
		.ok_or_else(|| Error::InvalidInput("Lexical state must contain 'root'".into()))?;
	let root_obj = root_data
		.as_object()
		.filter(|obj| obj.get("type").is_some_and(Value::is_string))
		.ok_or_else(|| Error::InvalidInput("root node must be an object with 'type'".into()))?;

	clear_tree(tree)?;

	let root_id = tree
		.create(TreeParentId::Root)
		.map_err(|e| Error::InvalidInput(format!("cannot create root node: {}", e)))?;
	import_node(tree, root_id, root_obj)?;

	debug!("Imported Lexical state, root: {}", tree_id_str(root_id));
	Ok(root_id)
}

fn import_node(tree: &LoroTree, node_id: TreeID, node: &Map<String, Value>) -> CoResult<()> {
	let element_type = node
		.get("type")
		.and_then(Value::as_str)
		.filter(|t| !t.is_empty())
		.ok_or_else(|| Error::InvalidInput("node is missing a non-empty 'type'".into()))?;

	set_node_meta(tree, node_id, element_type, clean_lexical_data(node))?;

	if let Some(children) = node.get("children").and_then(Value::as_array) {
		for (index, child) in children.iter().enumerate() {
			let Some(child_obj) = child.as_object().filter(|o| o.contains_key("type")) else {
				return Err(Error::InvalidInput(format!("child {} is not a typed node", index)));
			};
			let child_id = tree
				.create_at(TreeParentId::Node(node_id), index)
				.map_err(|e| Error::InvalidInput(format!("cannot create child node: {}", e)))?;
			import_node(tree, child_id, child_obj)?;
		}
	}
	Ok(())
}

/// Export the subtree under `root` as a Lexical state.
///
/// Every node gets a fresh `__key`; `children` is omitted when empty.
pub fn export_lexical(tree: &LoroTree, root: TreeID) -> CoResult<Value> {
	let root_node = export_node(tree, root)?;

	let mut state = Map::new();
	state.insert("root".to_string(), root_node);
	Ok(Value::Object(state))
}

fn export_node(tree: &LoroTree, node_id: TreeID) -> CoResult<Value> {
	let (element_type, lexical) = node_meta(tree, node_id)?;

	let mut node = lexical;
	node.insert("type".to_string(), Value::String(element_type));
	node.insert("__key".to_string(), Value::String(random_lexical_key()));

	let mut children = Vec::new();
	for child_id in children_of(tree, node_id) {
		children.push(export_node(tree, child_id)?);
	}
	if !children.is_empty() {
		node.insert("children".to_string(), Value::Array(children));
	}

	Ok(Value::Object(node))
}

/// Write `elementType` and the cleaned `lexical` bag onto a node's meta map.
pub fn set_node_meta(
	tree: &LoroTree,
	node_id: TreeID,
	element_type: &str,
	lexical: Map<String, Value>,
) -> CoResult<()> {
	let meta = tree
		.get_meta(node_id)
		.map_err(|e| Error::UnknownNode(format!("{}: {}", tree_id_str(node_id), e)))?;
	meta.insert(META_ELEMENT_TYPE, element_type)
		.map_err(|e| Error::InvalidInput(format!("cannot store element type: {}", e)))?;
	meta.insert(META_LEXICAL, loro_value_from_json(&Value::Object(lexical))?)
		.map_err(|e| Error::InvalidInput(format!("cannot store lexical data: {}", e)))?;
	Ok(())
}

/// Read a node's `elementType` and `lexical` bag back as JSON.
pub fn node_meta(tree: &LoroTree, node_id: TreeID) -> CoResult<(String, Map<String, Value>)> {
	let meta = tree
		.get_meta(node_id)
		.map_err(|e| Error::UnknownNode(format!("{}: {}", tree_id_str(node_id), e)))?;

	let element_type = match meta.get(META_ELEMENT_TYPE) {
		Some(ValueOrContainer::Value(LoroValue::String(s))) => s.to_string(),
		_ => {
			warn!("node {} is missing elementType", tree_id_str(node_id));
			"unknown".to_string()
		}
	};

	let lexical = match meta.get(META_LEXICAL) {
		Some(ValueOrContainer::Value(value)) => match json_from_loro_value(&value)? {
			Value::Object(map) => map,
			_ => Map::new(),
		},
		_ => Map::new(),
	};

	Ok((element_type, lexical))
}

/// Element type of a single node.
pub fn element_type_of(tree: &LoroTree, node_id: TreeID) -> CoResult<String> {
	Ok(node_meta(tree, node_id)?.0)
}

/// Delete every node, leaving an empty tree.
pub fn clear_tree(tree: &LoroTree) -> CoResult<()> {
	for root in tree.roots() {
		tree.delete(root)
			.map_err(|e| Error::InvalidInput(format!("cannot clear tree: {}", e)))?;
	}
	Ok(())
}

/// Node count per element type over the whole tree.
pub fn tree_stats(tree: &LoroTree) -> BTreeMap<String, usize> {
	let mut stats = BTreeMap::new();
	for node_id in tree.nodes() {
		let element_type = element_type_of(tree, node_id).unwrap_or_else(|_| "unknown".into());
		*stats.entry(element_type).or_insert(0) += 1;
	}
	stats
}

/// Strip structural and key fields from a Lexical node before storage.
pub fn clean_lexical_data(node: &Map<String, Value>) -> Map<String, Value> {
	let mut cleaned = Map::new();
	for (key, value) in node {
		if !STRIPPED_FIELDS.contains(&key.as_str()) && key != "type" {
			cleaned.insert(key.clone(), value.clone());
		}
	}
	cleaned
}


// vim: ts=4

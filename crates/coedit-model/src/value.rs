//! JSON / LoroValue bridging
//!
//! Node metadata arrives as `serde_json::Value` from the editor and is stored
//! as plain `LoroValue` entries on each tree node's meta map. Loro's value
//! type (de)serializes as plain JSON, so the bridge is a serde round-trip.

use loro::LoroValue;
use serde_json::Value;

use crate::prelude::*;

/// Convert arbitrary JSON into a Loro value tree.
pub fn loro_value_from_json(value: &Value) -> CoResult<LoroValue> {
	serde_json::from_value(value.clone()).map_err(|e| {
		warn!("json to loro value conversion failed: {}", e);
		Error::Parse
	})
}

/// Convert a Loro value tree back into JSON.
pub fn json_from_loro_value(value: &LoroValue) -> CoResult<Value> {
	serde_json::to_value(value).map_err(|e| {
		warn!("loro value to json conversion failed: {}", e);
		Error::Parse
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_json_roundtrip_through_loro_value() {
		let original = json!({
			"text": "Hello",
			"format": 0,
			"indent": 0,
			"direction": null,
			"nested": { "tag": "h1", "flags": [1, 2, 3] }
		});

		let loro = loro_value_from_json(&original).unwrap();
		let back = json_from_loro_value(&loro).unwrap();
		assert_eq!(original, back);
	}

	#[test]
	fn test_scalars_roundtrip() {
		for value in [json!(true), json!(42), json!(4.5), json!("x"), json!(null)] {
			let loro = loro_value_from_json(&value).unwrap();
			assert_eq!(json_from_loro_value(&loro).unwrap(), value);
		}
	}
}

// vim: ts=4

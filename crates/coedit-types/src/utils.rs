//! Utility functions

use rand::RngExt;
use sha2::{Digest, Sha256};

pub const ID_LENGTH: usize = 24;
pub const LEXICAL_KEY_LENGTH: usize = 8;
pub const SAFE: [char; 62] = [
	'0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
	'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
	'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
	'V', 'W', 'X', 'Y', 'Z',
];

/// Peer colors assigned to clients, matching the palette the editor uses
/// for remote cursors and selections.
pub const PEER_COLORS: [&str; 15] = [
	"#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FECA57", "#FF9FF3", "#54A0FF", "#5F27CD",
	"#00D2D3", "#FF9F43", "#C44569", "#F8B500", "#6C5CE7", "#A29BFE", "#FD79A8",
];

fn random_chars(len: usize) -> String {
	let mut rng = rand::rng();
	let mut result = String::with_capacity(len);

	for _ in 0..len {
		result.push(SAFE[rng.random_range(0..SAFE.len())]);
	}
	result
}

/// Random alphanumeric identifier for connections and message ids.
pub fn random_id() -> String {
	random_chars(ID_LENGTH)
}

/// Short random key in the shape Lexical generates for its nodes.
///
/// Regenerated on every JSON export; the tree id is the durable identity.
pub fn random_lexical_key() -> String {
	random_chars(LEXICAL_KEY_LENGTH)
}

/// Deterministic peer color derived from a stable hash of the client id.
pub fn color_for_client(client_id: &str) -> &'static str {
	let digest = Sha256::digest(client_id.as_bytes());
	let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
	PEER_COLORS[hash as usize % PEER_COLORS.len()]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_random_id_shape() {
		let id = random_id();
		assert_eq!(id.len(), ID_LENGTH);
		assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
	}

	#[test]
	fn test_random_lexical_key_shape() {
		let key = random_lexical_key();
		assert_eq!(key.len(), LEXICAL_KEY_LENGTH);
		assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
	}

	#[test]
	fn test_color_is_deterministic() {
		let a = color_for_client("client-1-abcdef");
		let b = color_for_client("client-1-abcdef");
		assert_eq!(a, b);
		assert!(PEER_COLORS.contains(&a));
	}
}

// vim: ts=4

//! Output script classification for address and stealth notification
//! matching.

use bitcoin::{
	hashes::{sha256d, Hash},
	script::Instruction,
	Script, Transaction,
};

use crate::{PAY_TO_PUBKEY_HASH_VERSION, PAY_TO_SCRIPT_HASH_VERSION};

/// Minimum null-data payload that can carry a stealth ephemeral key.
const STEALTH_PAYLOAD_MIN: usize = 33;

/// The 20 byte hash (and address version) of a standard payment output,
/// or `None` for any other script shape.
pub fn payment_address_hash(script: &Script) -> Option<(u8, [u8; 20])> {
	let bytes = script.as_bytes();
	if script.is_p2pkh() {
		Some((PAY_TO_PUBKEY_HASH_VERSION, bytes[3..23].try_into().expect("20 bytes")))
	} else if script.is_p2sh() {
		Some((PAY_TO_SCRIPT_HASH_VERSION, bytes[2..22].try_into().expect("20 bytes")))
	} else {
		None
	}
}

/// The single pushed payload of an OP_RETURN script, when large enough to
/// carry stealth metadata.
pub fn null_data_payload(script: &Script) -> Option<&[u8]> {
	if !script.is_op_return() {
		return None
	}
	let mut instructions = script.instructions();
	instructions.next(); // OP_RETURN
	match instructions.next() {
		Some(Ok(Instruction::PushBytes(push))) if push.len() >= STEALTH_PAYLOAD_MIN =>
			Some(push.as_bytes()),
		_ => None,
	}
}

/// Stealth prefix of an OP_RETURN script: the first four bytes of the
/// double sha256 of the serialized script.
pub fn stealth_prefix(script: &Script) -> Option<[u8; 4]> {
	null_data_payload(script)?;
	let digest = sha256d::Hash::hash(script.as_bytes()).to_byte_array();
	Some(digest[..4].try_into().expect("4 bytes"))
}

/// Ephemeral public key carried by a stealth OP_RETURN payload (the 32
/// bytes following the format byte).
pub fn stealth_ephemeral_key(script: &Script) -> Option<[u8; 32]> {
	let payload = null_data_payload(script)?;
	Some(payload[1..33].try_into().expect("32 bytes"))
}

/// The stealth prefix a transaction exposes, if any: that of its first
/// qualifying OP_RETURN output.
pub fn transaction_stealth_prefix(tx: &Transaction) -> Option<[u8; 4]> {
	tx.output.iter().find_map(|output| stealth_prefix(&output.script_pubkey))
}

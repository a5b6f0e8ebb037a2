//! Typed wrappers over the raw backend: one free function per published
//! command. Each parses the leading error code and decodes the body before
//! invoking the caller's handler.

use bitcoin::{block::Header, consensus, hashes::Hash, BlockHash, Transaction, Txid};
use gateway_protocol::{
	commands, ErrorCode, HistoryRow, Message, Prefix, StealthRow, SubscriptionKind,
	HISTORY_ROW_SIZE, STEALTH_ROW_SIZE,
};

use crate::Backend;

/// A decoded subscription notification.
#[derive(Debug, Clone)]
pub enum Update {
	Address {
		version: u8,
		address_hash: [u8; 20],
		height: u32,
		block_hash: BlockHash,
		transaction: Transaction,
	},
	Stealth {
		prefix: [u8; 4],
		height: u32,
		block_hash: BlockHash,
		transaction: Transaction,
	},
}

pub fn fetch_last_height(
	backend: &mut Backend,
	handler: impl FnOnce(Result<u32, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(commands::FETCH_LAST_HEIGHT, vec![], move |data| {
		handler(expect_success(&data).and_then(decode_u32));
	})
}

pub fn fetch_history(
	backend: &mut Backend,
	version: u8,
	address_hash: [u8; 20],
	from_height: Option<u64>,
	handler: impl FnOnce(Result<Vec<HistoryRow>, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	let mut data = Vec::with_capacity(29);
	data.push(version);
	data.extend_from_slice(&address_hash);
	if let Some(height) = from_height {
		data.extend_from_slice(&height.to_le_bytes());
	}
	backend.request(commands::FETCH_HISTORY, data, move |data| {
		handler(expect_success(&data).and_then(decode_history));
	})
}

pub fn fetch_history2(
	backend: &mut Backend,
	version: u8,
	address_hash: [u8; 20],
	from_height: Option<u32>,
	handler: impl FnOnce(Result<Vec<HistoryRow>, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	let mut data = Vec::with_capacity(25);
	data.push(version);
	data.extend_from_slice(&address_hash);
	if let Some(height) = from_height {
		data.extend_from_slice(&height.to_le_bytes());
	}
	backend.request(commands::FETCH_HISTORY2, data, move |data| {
		handler(expect_success(&data).and_then(decode_history));
	})
}

pub fn fetch_transaction(
	backend: &mut Backend,
	hash: Txid,
	handler: impl FnOnce(Result<Transaction, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(
		commands::FETCH_TRANSACTION,
		hash.to_byte_array().to_vec(),
		move |data| handler(expect_success(&data).and_then(decode_transaction)),
	)
}

pub fn fetch_block_header_by_height(
	backend: &mut Backend,
	height: u32,
	handler: impl FnOnce(Result<Header, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(
		commands::FETCH_BLOCK_HEADER,
		height.to_le_bytes().to_vec(),
		move |data| handler(expect_success(&data).and_then(decode_header)),
	)
}

pub fn fetch_block_header_by_hash(
	backend: &mut Backend,
	hash: BlockHash,
	handler: impl FnOnce(Result<Header, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(
		commands::FETCH_BLOCK_HEADER,
		hash.to_byte_array().to_vec(),
		move |data| handler(expect_success(&data).and_then(decode_header)),
	)
}

pub fn fetch_transaction_index(
	backend: &mut Backend,
	hash: Txid,
	handler: impl FnOnce(Result<(u32, u32), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(
		commands::FETCH_TRANSACTION_INDEX,
		hash.to_byte_array().to_vec(),
		move |data| {
			handler(expect_success(&data).and_then(|body| {
				if body.len() != 8 {
					return Err(ErrorCode::BadStream)
				}
				Ok((
					u32::from_le_bytes(body[..4].try_into().expect("4 bytes")),
					u32::from_le_bytes(body[4..].try_into().expect("4 bytes")),
				))
			}))
		},
	)
}

pub fn fetch_stealth(
	backend: &mut Backend,
	prefix: &Prefix,
	from_height: Option<u32>,
	handler: impl FnOnce(Result<Vec<StealthRow>, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	let mut data = Vec::with_capacity(1 + prefix.blocks().len() + 4);
	data.push(prefix.bits() as u8);
	data.extend_from_slice(prefix.blocks());
	if let Some(height) = from_height {
		data.extend_from_slice(&height.to_le_bytes());
	}
	backend.request(commands::FETCH_STEALTH, data, move |data| {
		handler(expect_success(&data).and_then(decode_stealth));
	})
}

pub fn broadcast(
	backend: &mut Backend,
	transaction: &Transaction,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	code_only(backend, commands::POOL_BROADCAST, consensus::serialize(transaction), handler)
}

pub fn validate2(
	backend: &mut Backend,
	transaction: &Transaction,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	code_only(backend, commands::POOL_VALIDATE2, consensus::serialize(transaction), handler)
}

pub fn pool_fetch_transaction(
	backend: &mut Backend,
	hash: Txid,
	handler: impl FnOnce(Result<Transaction, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(
		commands::POOL_FETCH_TRANSACTION,
		hash.to_byte_array().to_vec(),
		move |data| handler(expect_success(&data).and_then(decode_transaction)),
	)
}

pub fn broadcast_transaction(
	backend: &mut Backend,
	transaction: &Transaction,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	code_only(
		backend,
		commands::BROADCAST_TRANSACTION,
		consensus::serialize(transaction),
		handler,
	)
}

pub fn total_connections(
	backend: &mut Backend,
	handler: impl FnOnce(Result<u32, ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(commands::TOTAL_CONNECTIONS, vec![], move |data| {
		handler(expect_success(&data).and_then(decode_u32));
	})
}

pub fn subscribe(
	backend: &mut Backend,
	kind: SubscriptionKind,
	prefix: &Prefix,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	code_only(backend, commands::SUBSCRIBE, subscription_payload(kind, prefix), handler)
}

pub fn renew(
	backend: &mut Backend,
	kind: SubscriptionKind,
	prefix: &Prefix,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	code_only(backend, commands::RENEW, subscription_payload(kind, prefix), handler)
}

pub fn unsubscribe(
	backend: &mut Backend,
	kind: SubscriptionKind,
	prefix: &Prefix,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	code_only(backend, commands::UNSUBSCRIBE, subscription_payload(kind, prefix), handler)
}

/// Decode a notification delivered to the backend's update handler.
pub fn parse_update(message: &Message) -> Option<Update> {
	let body = expect_success(&message.data).ok()?;
	match message.command.as_str() {
		commands::ADDRESS_UPDATE => {
			// [ version:1 ] [ hash:20 ] [ height:4 ] [ block_hash:32 ] [ tx ]
			if body.len() < 57 {
				return None
			}
			Some(Update::Address {
				version: body[0],
				address_hash: body[1..21].try_into().expect("20 bytes"),
				height: u32::from_le_bytes(body[21..25].try_into().expect("4 bytes")),
				block_hash: BlockHash::from_byte_array(
					body[25..57].try_into().expect("32 bytes"),
				),
				transaction: consensus::deserialize(&body[57..]).ok()?,
			})
		},
		commands::STEALTH_UPDATE => {
			// [ prefix:4 ] [ height:4 ] [ block_hash:32 ] [ tx ]
			if body.len() < 40 {
				return None
			}
			Some(Update::Stealth {
				prefix: body[..4].try_into().expect("4 bytes"),
				height: u32::from_le_bytes(body[4..8].try_into().expect("4 bytes")),
				block_hash: BlockHash::from_byte_array(
					body[8..40].try_into().expect("32 bytes"),
				),
				transaction: consensus::deserialize(&body[40..]).ok()?,
			})
		},
		_ => None,
	}
}

fn subscription_payload(kind: SubscriptionKind, prefix: &Prefix) -> Vec<u8> {
	let mut data = Vec::with_capacity(2 + prefix.blocks().len());
	data.push(kind as u8);
	data.push(prefix.bits() as u8);
	data.extend_from_slice(prefix.blocks());
	data
}

fn code_only(
	backend: &mut Backend,
	command: &str,
	data: Vec<u8>,
	handler: impl FnOnce(Result<(), ErrorCode>) + Send + 'static,
) -> anyhow::Result<u32> {
	backend.request(command, data, move |data| {
		handler(expect_success(&data).map(|_| ()));
	})
}

/// Split off the leading 4 byte code; anything but `Success` is the error.
fn expect_success(data: &[u8]) -> Result<&[u8], ErrorCode> {
	if data.len() < 4 {
		return Err(ErrorCode::BadStream)
	}
	match ErrorCode::from_bytes(data[..4].try_into().expect("4 bytes")) {
		ErrorCode::Success => Ok(&data[4..]),
		code => Err(code),
	}
}

fn decode_u32(body: &[u8]) -> Result<u32, ErrorCode> {
	if body.len() != 4 {
		return Err(ErrorCode::BadStream)
	}
	Ok(u32::from_le_bytes(body.try_into().expect("4 bytes")))
}

fn decode_transaction(body: &[u8]) -> Result<Transaction, ErrorCode> {
	consensus::deserialize(body).map_err(|_| ErrorCode::BadStream)
}

fn decode_header(body: &[u8]) -> Result<Header, ErrorCode> {
	if body.len() != 80 {
		return Err(ErrorCode::BadStream)
	}
	consensus::deserialize(body).map_err(|_| ErrorCode::BadStream)
}

fn decode_history(body: &[u8]) -> Result<Vec<HistoryRow>, ErrorCode> {
	if body.len() % HISTORY_ROW_SIZE != 0 {
		return Err(ErrorCode::BadStream)
	}
	body.chunks(HISTORY_ROW_SIZE)
		.map(|chunk| HistoryRow::read(chunk).ok_or(ErrorCode::BadStream))
		.collect()
}

fn decode_stealth(body: &[u8]) -> Result<Vec<StealthRow>, ErrorCode> {
	if body.len() % STEALTH_ROW_SIZE != 0 {
		return Err(ErrorCode::BadStream)
	}
	body.chunks(STEALTH_ROW_SIZE)
		.map(|chunk| StealthRow::read(chunk).ok_or(ErrorCode::BadStream))
		.collect()
}

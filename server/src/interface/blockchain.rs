use std::sync::Arc;

use bitcoin::{consensus, hashes::Hash, BlockHash, Txid};
use gateway_protocol::{commands, ErrorCode, Message, Prefix};
use tokio::runtime::Handle;

use crate::{node::FullNode, workers::QueryWorker};

pub fn attach(worker: &QueryWorker, node: Arc<dyn FullNode>, runtime: Handle) {
	// The legacy history command carries an 8 byte from_height, its
	// successor a 4 byte one. Same semantics otherwise.
	attach_history(worker, node.clone(), runtime.clone(), commands::FETCH_HISTORY, 8);
	attach_history(worker, node.clone(), runtime.clone(), commands::FETCH_HISTORY2, 4);

	worker.attach(commands::FETCH_TRANSACTION, {
		let node = node.clone();
		let runtime = runtime.clone();
		move |request, sender| {
			// [ tx_hash:32 ]
			let Ok(hash) = <[u8; 32]>::try_from(request.data.as_slice()) else {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			};
			let node = node.clone();
			runtime.spawn(async move {
				let response = match node.fetch_transaction(Txid::from_byte_array(hash)).await {
					Ok(transaction) =>
						Message::result(&request, &consensus::serialize(&transaction)),
					Err(code) => Message::error(&request, code),
				};
				sender.send(response);
			});
		}
	});

	worker.attach(commands::FETCH_LAST_HEIGHT, {
		let node = node.clone();
		let runtime = runtime.clone();
		move |request, sender| {
			if !request.data.is_empty() {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			}
			let node = node.clone();
			runtime.spawn(async move {
				let response = match node.fetch_last_height().await {
					Ok(height) => Message::result(&request, &height.to_le_bytes()),
					Err(code) => Message::error(&request, code),
				};
				sender.send(response);
			});
		}
	});

	worker.attach(commands::FETCH_BLOCK_HEADER, {
		let node = node.clone();
		let runtime = runtime.clone();
		move |request, sender| {
			// [ height:4 ] or [ block_hash:32 ]
			enum Key {
				Height(u32),
				Hash(BlockHash),
			}
			let key = match request.data.len() {
				4 => Key::Height(u32::from_le_bytes(
					request.data.as_slice().try_into().expect("4 bytes"),
				)),
				32 => Key::Hash(BlockHash::from_byte_array(
					request.data.as_slice().try_into().expect("32 bytes"),
				)),
				_ => {
					sender.send(Message::error(&request, ErrorCode::BadStream));
					return
				},
			};
			let node = node.clone();
			runtime.spawn(async move {
				let header = match key {
					Key::Height(height) => node.block_header_by_height(height).await,
					Key::Hash(hash) => node.block_header_by_hash(hash).await,
				};
				let response = match header {
					Ok(header) => Message::result(&request, &consensus::serialize(&header)),
					Err(code) => Message::error(&request, code),
				};
				sender.send(response);
			});
		}
	});

	worker.attach(commands::FETCH_TRANSACTION_INDEX, {
		let node = node.clone();
		let runtime = runtime.clone();
		move |request, sender| {
			// [ tx_hash:32 ]
			let Ok(hash) = <[u8; 32]>::try_from(request.data.as_slice()) else {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			};
			let node = node.clone();
			runtime.spawn(async move {
				let response = match node.transaction_index(Txid::from_byte_array(hash)).await
				{
					Ok((height, position)) => {
						let mut body = Vec::with_capacity(8);
						body.extend_from_slice(&height.to_le_bytes());
						body.extend_from_slice(&position.to_le_bytes());
						Message::result(&request, &body)
					},
					Err(code) => Message::error(&request, code),
				};
				sender.send(response);
			});
		}
	});

	worker.attach(commands::FETCH_STEALTH, {
		move |request, sender| {
			// [ bits:1 ] [ prefix_blocks:⌈bits/8⌉ ] [ from_height:4 ]?
			let data = &request.data;
			if data.is_empty() {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			}
			let bits = u16::from(data[0]);
			let blocks = Prefix::blocks_size(bits);

			let from_height = match data.len() - 1 {
				length if length == blocks => 0,
				length if length == blocks + 4 => u32::from_le_bytes(
					data[1 + blocks..].try_into().expect("4 bytes"),
				),
				_ => {
					sender.send(Message::error(&request, ErrorCode::BadStream));
					return
				},
			};
			let Some(prefix) = Prefix::new(bits, data[1..1 + blocks].to_vec()) else {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			};

			let node = node.clone();
			runtime.spawn(async move {
				let response = match node.fetch_stealth(prefix, from_height).await {
					Ok(rows) => {
						let mut body = Vec::new();
						for row in &rows {
							row.write(&mut body);
						}
						Message::result(&request, &body)
					},
					Err(code) => Message::error(&request, code),
				};
				sender.send(response);
			});
		}
	});
}

fn attach_history(
	worker: &QueryWorker,
	node: Arc<dyn FullNode>,
	runtime: Handle,
	command: &'static str,
	from_height_size: usize,
) {
	worker.attach(command, move |request, sender| {
		// [ version:1 ] [ address_hash:20 ] [ from_height ]?
		let data = &request.data;
		if data.len() != 21 && data.len() != 21 + from_height_size {
			sender.send(Message::error(&request, ErrorCode::BadStream));
			return
		}

		let hash: [u8; 20] = data[1..21].try_into().expect("20 bytes");
		let from_height = if data.len() == 21 {
			0
		} else if from_height_size == 4 {
			u32::from_le_bytes(data[21..25].try_into().expect("4 bytes"))
		} else {
			// The legacy field is 8 bytes; heights saturate into 32 bits.
			u64::from_le_bytes(data[21..29].try_into().expect("8 bytes"))
				.min(u64::from(u32::MAX)) as u32
		};

		let node = node.clone();
		runtime.spawn(async move {
			let response = match node.fetch_history(hash, from_height).await {
				Ok(rows) => {
					let mut body = Vec::with_capacity(rows.len() * 88);
					for row in &rows {
						row.write(&mut body);
					}
					Message::result(&request, &body)
				},
				Err(code) => Message::error(&request, code),
			};
			sender.send(response);
		});
	});
}

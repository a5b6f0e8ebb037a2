use std::sync::Arc;

use bitcoin::{consensus, hashes::Hash, Transaction, Txid};
use gateway_protocol::{commands, ErrorCode, Message};
use tokio::runtime::Handle;

use crate::{node::FullNode, workers::QueryWorker};

pub fn attach(worker: &QueryWorker, node: Arc<dyn FullNode>, runtime: Handle) {
	// Save to the pool and announce to peers.
	attach_organize(worker, node.clone(), runtime.clone(), commands::POOL_BROADCAST, false);
	// Validate only; nothing is retained.
	attach_organize(worker, node.clone(), runtime.clone(), commands::POOL_VALIDATE2, true);

	worker.attach(commands::POOL_FETCH_TRANSACTION, {
		move |request, sender| {
			// [ tx_hash:32 ] — the response allows confirmed and
			// unconfirmed transactions.
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
}

fn attach_organize(
	worker: &QueryWorker,
	node: Arc<dyn FullNode>,
	runtime: Handle,
	command: &'static str,
	simulate: bool,
) {
	worker.attach(command, move |request, sender| {
		// [ canonical tx bytes ]
		let Ok(transaction) = consensus::deserialize::<Transaction>(&request.data) else {
			sender.send(Message::error(&request, ErrorCode::BadStream));
			return
		};
		let node = node.clone();
		runtime.spawn(async move {
			// Error code only: validation failure or success.
			let code = match node.organize(transaction, simulate).await {
				Ok(()) => ErrorCode::Success,
				Err(code) => code,
			};
			sender.send(Message::error(&request, code));
		});
	});
}

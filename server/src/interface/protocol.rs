use std::sync::Arc;

use bitcoin::{consensus, Transaction};
use gateway_protocol::{commands, ErrorCode, Message};
use tokio::runtime::Handle;

use crate::{node::FullNode, workers::QueryWorker};

pub fn attach(worker: &QueryWorker, node: Arc<dyn FullNode>, runtime: Handle) {
	worker.attach(commands::BROADCAST_TRANSACTION, {
		let node = node.clone();
		move |request, sender| {
			// [ canonical tx bytes ] — relay only, the pool is untouched.
			let Ok(transaction) = consensus::deserialize::<Transaction>(&request.data) else {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			};
			let node = node.clone();
			runtime.spawn(async move {
				let code = match node.broadcast(transaction).await {
					Ok(()) => ErrorCode::Success,
					Err(code) => code,
				};
				sender.send(Message::error(&request, code));
			});
		}
	});

	worker.attach(commands::TOTAL_CONNECTIONS, {
		move |request, sender| {
			if !request.data.is_empty() {
				sender.send(Message::error(&request, ErrorCode::BadStream));
				return
			}
			// [ code:4 ] [ connections:4 ]
			let count = node.connection_count();
			sender.send(Message::result(&request, &count.to_le_bytes()));
		}
	});
}

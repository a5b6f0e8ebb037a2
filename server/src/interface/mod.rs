//! The published command table: class.method names mapped onto worker
//! handlers. Payloads are validated here; node calls resolve on the
//! runtime with the reply sender carried into the continuation.

pub mod address;
pub mod blockchain;
pub mod protocol;
pub mod transaction_pool;

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::{node::FullNode, subscriptions::SubscriptionManager, workers::QueryWorker};

/// Register every command on the worker pool.
pub fn attach(
	worker: &QueryWorker,
	node: Arc<dyn FullNode>,
	subscriptions: Arc<SubscriptionManager>,
	runtime: Handle,
) {
	blockchain::attach(worker, node.clone(), runtime.clone());
	transaction_pool::attach(worker, node.clone(), runtime.clone());
	protocol::attach(worker, node, runtime);
	address::attach(worker, subscriptions);
}

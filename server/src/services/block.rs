//! Publishes every block the node's reorganization events deliver, in
//! order, and feeds the confirmed transactions through the subscription
//! manager.
//!
//! Block frame layout: `height:4 LE` + `header:80` + one 32 byte hash per
//! transaction in block order.

use std::sync::Arc;

use anyhow::Context;
use bitcoin::{consensus, hashes::Hash, Block};
use tokio::{sync::broadcast::error::RecvError, sync::watch, task::JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
	auth::{Authenticator, DO_NOT_LINGER},
	node::FullNode,
	subscriptions::SubscriptionManager,
};

pub struct BlockService {
	context: zmq::Context,
	authenticator: Arc<Authenticator>,
	endpoint: String,
	node: Arc<dyn FullNode>,
	subscriptions: Arc<SubscriptionManager>,
	stop: Option<watch::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

impl BlockService {
	pub fn new(
		context: zmq::Context,
		authenticator: Arc<Authenticator>,
		endpoint: String,
		node: Arc<dyn FullNode>,
		subscriptions: Arc<SubscriptionManager>,
	) -> Self {
		BlockService {
			context,
			authenticator,
			endpoint,
			node,
			subscriptions,
			stop: None,
			task: None,
		}
	}

	pub fn start(&mut self) -> anyhow::Result<()> {
		if self.task.is_some() {
			return Ok(())
		}

		let publisher = self.context.socket(zmq::PUB)?;
		publisher.set_linger(DO_NOT_LINGER)?;
		self.authenticator.apply(&publisher, "block", false)?;
		publisher
			.bind(&self.endpoint)
			.with_context(|| format!("Failed to bind block endpoint {}", self.endpoint))?;

		info!("Block publisher on {}", self.endpoint);

		let mut reorganizations = self.node.subscribe_reorganizations();
		let subscriptions = self.subscriptions.clone();
		let (stop_sender, mut stop_receiver) = watch::channel(());

		self.task = Some(tokio::spawn(
			async move {
				loop {
					tokio::select! {
						_ = stop_receiver.changed() => break,
						event = reorganizations.recv() => match event {
							Ok(reorganization) => {
								let mut height = reorganization.fork_height;
								for block in reorganization.new_blocks.iter() {
									height += 1;
									publish_block(&publisher, height, block);

									let block_hash = block.header.block_hash();
									for transaction in &block.txdata {
										subscriptions.submit(height, &block_hash, transaction);
									}
								}
							},
							Err(RecvError::Closed) => {
								debug!("Reorganization subscription ended, stopping");
								break
							},
							Err(RecvError::Lagged(missed)) =>
								warn!("Dropped {missed} reorganization events"),
						},
					}
				}
			}
			.instrument(info_span!("block-service")),
		));
		self.stop = Some(stop_sender);
		Ok(())
	}

	pub async fn stop(&mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}

fn publish_block(publisher: &zmq::Socket, height: u32, block: &Block) {
	let mut frame = Vec::with_capacity(84 + 32 * block.txdata.len());
	frame.extend_from_slice(&height.to_le_bytes());
	frame.extend_from_slice(&consensus::serialize(&block.header));
	for transaction in &block.txdata {
		frame.extend_from_slice(&transaction.compute_txid().to_byte_array());
	}

	// A failure here must not prevent subsequent blocks from publishing.
	if let Err(error) = publisher.send(frame, zmq::DONTWAIT) {
		warn!("Failed to publish block {height}: {error}");
	}
}

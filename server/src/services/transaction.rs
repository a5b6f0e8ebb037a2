//! Publishes every transaction the pool accepts: one frame of canonical
//! transaction bytes per event. Unconfirmed submissions reach address and
//! stealth subscribers with height 0 and a zeroed block hash.

use std::sync::Arc;

use anyhow::Context;
use bitcoin::{consensus, hashes::Hash, BlockHash};
use tokio::{sync::broadcast::error::RecvError, sync::watch, task::JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
	auth::{Authenticator, DO_NOT_LINGER},
	node::FullNode,
	subscriptions::SubscriptionManager,
};

pub struct TransactionService {
	context: zmq::Context,
	authenticator: Arc<Authenticator>,
	endpoint: String,
	node: Arc<dyn FullNode>,
	subscriptions: Arc<SubscriptionManager>,
	stop: Option<watch::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

impl TransactionService {
	pub fn new(
		context: zmq::Context,
		authenticator: Arc<Authenticator>,
		endpoint: String,
		node: Arc<dyn FullNode>,
		subscriptions: Arc<SubscriptionManager>,
	) -> Self {
		TransactionService {
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
		self.authenticator.apply(&publisher, "transaction", false)?;
		publisher.bind(&self.endpoint).with_context(|| {
			format!("Failed to bind transaction endpoint {}", self.endpoint)
		})?;

		info!("Transaction publisher on {}", self.endpoint);

		let mut accepted = self.node.subscribe_transactions();
		let subscriptions = self.subscriptions.clone();
		let (stop_sender, mut stop_receiver) = watch::channel(());

		self.task = Some(tokio::spawn(
			async move {
				let unconfirmed = BlockHash::all_zeros();
				loop {
					tokio::select! {
						_ = stop_receiver.changed() => break,
						event = accepted.recv() => match event {
							Ok(transaction) => {
								if let Err(error) = publisher
									.send(consensus::serialize(&transaction), zmq::DONTWAIT)
								{
									warn!("Failed to publish a transaction: {error}");
								}
								subscriptions.submit(0, &unconfirmed, &transaction);
							},
							Err(RecvError::Closed) => {
								debug!("Transaction subscription ended, stopping");
								break
							},
							Err(RecvError::Lagged(missed)) =>
								warn!("Dropped {missed} accepted transactions"),
						},
					}
				}
			}
			.instrument(info_span!("transaction-service")),
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

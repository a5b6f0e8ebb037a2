//! Assembles the authenticator, services, worker pools and subscription
//! manager around one node. Start binds everything in order; stop unwinds
//! in reverse.

use std::sync::Arc;

use tokio::{runtime::Handle, sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
	auth::{start_authentication_thread, Authenticator, AuthenticatorHandle},
	interface,
	node::FullNode,
	services::{
		block::BlockService, heartbeat::HeartbeatService, query::QueryService,
		transaction::TransactionService,
	},
	settings::Settings,
	subscriptions::SubscriptionManager,
	workers::{QuerySender, QueryWorker},
};

pub struct ServerNode {
	settings: Settings,
	node: Arc<dyn FullNode>,
	context: zmq::Context,
	authenticator: Arc<Authenticator>,
	subscriptions: Arc<SubscriptionManager>,
	auth_handle: Option<AuthenticatorHandle>,
	query: Option<QueryService>,
	secure_query: Option<QueryService>,
	workers: Option<QueryWorker>,
	secure_workers: Option<QueryWorker>,
	heartbeat: Option<HeartbeatService>,
	block: Option<BlockService>,
	transaction: Option<TransactionService>,
	sweeper_stop: Option<watch::Sender<()>>,
	sweeper: Option<JoinHandle<()>>,
}

impl ServerNode {
	pub fn new(settings: Settings, node: Arc<dyn FullNode>) -> anyhow::Result<Self> {
		let context = zmq::Context::new();
		let authenticator = Arc::new(Authenticator::new(&settings.server)?);

		let subscriptions = Arc::new(SubscriptionManager::new(
			settings.server.subscription_limit,
			settings.server.subscription_expiration(),
			QuerySender::new(context.clone(), QueryService::notification_endpoint(false).to_string()),
			settings.server.secure_query_endpoint.as_ref().map(|_| {
				QuerySender::new(
					context.clone(),
					QueryService::notification_endpoint(true).to_string(),
				)
			}),
		));

		Ok(ServerNode {
			settings,
			node,
			context,
			authenticator,
			subscriptions,
			auth_handle: None,
			query: None,
			secure_query: None,
			workers: None,
			secure_workers: None,
			heartbeat: None,
			block: None,
			transaction: None,
			sweeper_stop: None,
			sweeper: None,
		})
	}

	pub fn subscriptions(&self) -> Arc<SubscriptionManager> {
		self.subscriptions.clone()
	}

	/// Bind and start everything the master switches enable. Must run on
	/// the runtime; restartable after `stop`.
	pub fn start(&mut self) -> anyhow::Result<()> {
		let server = self.settings.server.clone();

		if self.auth_handle.is_none() {
			self.auth_handle = Some(start_authentication_thread(
				self.context.clone(),
				self.authenticator.clone(),
			)?);
		}

		if server.queries_enabled {
			self.start_query_endpoint(server.query_endpoint.clone(), false)?;
			if let Some(endpoint) = server.secure_query_endpoint.clone() {
				self.start_query_endpoint(endpoint, true)?;
			}
			self.start_sweeper();
		}

		if server.publisher_enabled {
			let mut heartbeat = HeartbeatService::new(
				self.context.clone(),
				self.authenticator.clone(),
				server.heartbeat_endpoint.clone(),
				server.heartbeat_interval(),
			);
			heartbeat.start()?;
			self.heartbeat = Some(heartbeat);

			let mut block = BlockService::new(
				self.context.clone(),
				self.authenticator.clone(),
				server.block_publish_endpoint.clone(),
				self.node.clone(),
				self.subscriptions.clone(),
			);
			block.start()?;
			self.block = Some(block);

			let mut transaction = TransactionService::new(
				self.context.clone(),
				self.authenticator.clone(),
				server.transaction_publish_endpoint.clone(),
				self.node.clone(),
				self.subscriptions.clone(),
			);
			transaction.start()?;
			self.transaction = Some(transaction);
		}

		info!("Server started");
		Ok(())
	}

	fn start_query_endpoint(&mut self, endpoint: String, secure: bool) -> anyhow::Result<()> {
		let mut service = QueryService::new(
			self.context.clone(),
			self.authenticator.clone(),
			endpoint,
			secure,
		);
		service.start()?;

		let mut workers = QueryWorker::new(self.context.clone(), secure);
		interface::attach(
			&workers,
			self.node.clone(),
			self.subscriptions.clone(),
			Handle::current(),
		);
		workers.start(self.settings.server.query_workers)?;

		if secure {
			self.secure_query = Some(service);
			self.secure_workers = Some(workers);
		} else {
			self.query = Some(service);
			self.workers = Some(workers);
		}
		Ok(())
	}

	/// Subscription expiry runs on the heartbeat cadence.
	fn start_sweeper(&mut self) {
		let (stop_sender, mut stop_receiver) = watch::channel(());
		let subscriptions = self.subscriptions.clone();
		let period = self.settings.server.heartbeat_interval();

		self.sweeper = Some(tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = stop_receiver.changed() => break,
					_ = interval.tick() => subscriptions.sweep(),
				}
			}
		}));
		self.sweeper_stop = Some(stop_sender);
	}

	/// Idempotent; unbinds in reverse start order.
	pub async fn stop(&mut self) {
		if let Some(mut transaction) = self.transaction.take() {
			transaction.stop().await;
		}
		if let Some(mut block) = self.block.take() {
			block.stop().await;
		}
		if let Some(mut heartbeat) = self.heartbeat.take() {
			heartbeat.stop().await;
		}

		if let Some(stop) = self.sweeper_stop.take() {
			let _ = stop.send(());
		}
		if let Some(sweeper) = self.sweeper.take() {
			let _ = sweeper.await;
		}

		// Joining the socket threads blocks briefly (one poll timeout at
		// most), which is tolerable at shutdown.
		if let Some(mut workers) = self.secure_workers.take() {
			workers.stop();
		}
		if let Some(mut workers) = self.workers.take() {
			workers.stop();
		}
		if let Some(mut query) = self.secure_query.take() {
			query.stop();
		}
		if let Some(mut query) = self.query.take() {
			query.stop();
		}
		if let Some(mut auth) = self.auth_handle.take() {
			auth.stop();
		}

		debug!("Server stopped");
	}
}

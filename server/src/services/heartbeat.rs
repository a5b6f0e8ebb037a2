//! Periodic pulse publisher: one 4 byte little-endian counter frame per
//! interval, advancing by one and wrapping at 2^32. Missed ticks collapse,
//! there is no catch-up.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, info_span, trace, warn, Instrument};

use crate::auth::{Authenticator, DO_NOT_LINGER};

pub struct HeartbeatService {
	context: zmq::Context,
	authenticator: Arc<Authenticator>,
	endpoint: String,
	interval: Duration,
	stop: Option<watch::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

impl HeartbeatService {
	pub fn new(
		context: zmq::Context,
		authenticator: Arc<Authenticator>,
		endpoint: String,
		interval: Duration,
	) -> Self {
		HeartbeatService { context, authenticator, endpoint, interval, stop: None, task: None }
	}

	/// Bind the publisher and start pulsing. Must be called on the runtime.
	pub fn start(&mut self) -> anyhow::Result<()> {
		if self.task.is_some() {
			return Ok(())
		}

		let publisher = self.context.socket(zmq::PUB)?;
		publisher.set_linger(DO_NOT_LINGER)?;
		self.authenticator.apply(&publisher, "heartbeat", false)?;
		publisher
			.bind(&self.endpoint)
			.with_context(|| format!("Failed to bind heartbeat endpoint {}", self.endpoint))?;

		info!("Heartbeat service on {} every {:?}", self.endpoint, self.interval);

		let (stop_sender, mut stop_receiver) = watch::channel(());
		let period = self.interval;

		self.task = Some(tokio::spawn(
			async move {
				let mut interval = tokio::time::interval(period);
				interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
				let mut counter: u32 = 0;

				loop {
					tokio::select! {
						_ = stop_receiver.changed() => break,
						_ = interval.tick() => {
							trace!("Pulse {counter}");
							if let Err(error) =
								publisher.send(&counter.to_le_bytes()[..], zmq::DONTWAIT)
							{
								// The counter advances either way.
								warn!("Failed to publish heartbeat: {error}");
							}
							counter = counter.wrapping_add(1);
						},
					}
				}
			}
			.instrument(info_span!("heartbeat")),
		));
		self.stop = Some(stop_sender);
		Ok(())
	}

	/// Cancels the next scheduled pulse and unbinds.
	pub async fn stop(&mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}

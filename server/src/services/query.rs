//! The query service: terminate client connections on an external ROUTER
//! and bridge them to the worker pool through an internal DEALER. A third
//! (PULL) socket carries subscription notifications straight to clients.
//! One dedicated thread per enabled endpoint runs the proxy loop.

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread::JoinHandle,
	time::Duration,
};

use anyhow::Context;
use gateway_protocol::receive_multipart;
use tracing::{debug, info, info_span, warn};

use crate::auth::{Authenticator, DO_NOT_LINGER};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct QueryService {
	context: zmq::Context,
	authenticator: Arc<Authenticator>,
	endpoint: String,
	secure: bool,
	stop: Arc<AtomicBool>,
	thread: Option<JoinHandle<()>>,
}

impl QueryService {
	/// The inprocess fan-out endpoint workers connect to.
	pub fn worker_endpoint(secure: bool) -> &'static str {
		if secure {
			"inproc://query-workers-secure"
		} else {
			"inproc://query-workers"
		}
	}

	/// The inprocess endpoint the subscription manager pushes
	/// notifications to.
	pub fn notification_endpoint(secure: bool) -> &'static str {
		if secure {
			"inproc://query-notifications-secure"
		} else {
			"inproc://query-notifications"
		}
	}

	pub fn new(
		context: zmq::Context,
		authenticator: Arc<Authenticator>,
		endpoint: String,
		secure: bool,
	) -> Self {
		QueryService {
			context,
			authenticator,
			endpoint,
			secure,
			stop: Arc::new(AtomicBool::new(false)),
			thread: None,
		}
	}

	/// Bind the external router and both internal sockets, then run the
	/// proxy on a dedicated thread. Restartable after `stop`.
	pub fn start(&mut self) -> anyhow::Result<()> {
		if self.thread.is_some() {
			return Ok(())
		}

		let router = self.context.socket(zmq::ROUTER)?;
		router.set_linger(DO_NOT_LINGER)?;
		self.authenticator.apply(
			&router,
			if self.secure { "query-secure" } else { "query" },
			self.secure,
		)?;
		router
			.bind(&self.endpoint)
			.with_context(|| format!("Failed to bind query endpoint {}", self.endpoint))?;

		let dealer = self.context.socket(zmq::DEALER)?;
		dealer.set_linger(DO_NOT_LINGER)?;
		dealer
			.bind(Self::worker_endpoint(self.secure))
			.context("Failed to bind the worker fan-out endpoint")?;

		let notifications = self.context.socket(zmq::PULL)?;
		notifications.set_linger(DO_NOT_LINGER)?;
		notifications
			.bind(Self::notification_endpoint(self.secure))
			.context("Failed to bind the notification endpoint")?;

		info!("Query service listening on {}", self.endpoint);

		self.stop.store(false, Ordering::Relaxed);
		let stop = self.stop.clone();
		let secure = self.secure;
		self.thread = Some(std::thread::spawn(move || {
			let span = info_span!("query-service", secure);
			let _entered = span.enter();
			proxy(router, dealer, notifications, stop);
			debug!("Query service stopped");
		}));
		Ok(())
	}

	/// Idempotent; ends the proxy loop and unbinds by dropping the sockets.
	pub fn stop(&mut self) {
		self.stop.store(true, Ordering::Relaxed);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for QueryService {
	fn drop(&mut self) {
		self.stop();
	}
}

/// Relay whole multipart messages between the three sockets. Frames are
/// never reordered or interleaved: each relay moves one complete message.
fn proxy(
	router: zmq::Socket,
	dealer: zmq::Socket,
	notifications: zmq::Socket,
	stop: Arc<AtomicBool>,
) {
	loop {
		if stop.load(Ordering::Relaxed) {
			break
		}

		let (request_ready, reply_ready, notification_ready) = {
			let mut items = [
				router.as_poll_item(zmq::POLLIN),
				dealer.as_poll_item(zmq::POLLIN),
				notifications.as_poll_item(zmq::POLLIN),
			];
			match zmq::poll(&mut items, POLL_TIMEOUT.as_millis() as i64) {
				Ok(0) => continue,
				Ok(_) => (
					items[0].is_readable(),
					items[1].is_readable(),
					items[2].is_readable(),
				),
				Err(error) => {
					debug!("Query proxy poll ended: {error}");
					break
				},
			}
		};

		if request_ready {
			relay(&router, &dealer);
		}
		if reply_ready {
			relay(&dealer, &router);
		}
		if notification_ready {
			relay(&notifications, &router);
		}
	}
}

fn relay(from: &zmq::Socket, to: &zmq::Socket) {
	match receive_multipart(from) {
		// Unroutable replies (the client has gone) are silently dropped by
		// the router.
		Ok(frames) =>
			if let Err(error) = to.send_multipart(frames, 0) {
				warn!("Failed to relay a message: {error}");
			},
		Err(error) => warn!("Failed to receive for relay: {error}"),
	}
}

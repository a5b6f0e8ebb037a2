//! The retry engine. One DEALER socket, one outstanding-request map keyed
//! by correlation id, driven entirely by `poll` from a single thread.
//!
//! Per request: created on send, removed on response or exhaustion, never
//! touched by more than one thread. Silence doubles the timeout and burns
//! a retry; at zero the request is abandoned and its handler never runs.

use std::{
	collections::HashMap,
	time::{Duration, Instant},
};

use gateway_protocol::{receive_multipart, Message};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
	/// First retry deadline; doubles on every resend.
	pub timeout: Duration,
	/// Resend attempts after the initial send.
	pub retries: u32,
}

impl Default for RetryOptions {
	fn default() -> Self {
		RetryOptions { timeout: Duration::from_secs(30), retries: 3 }
	}
}

struct Pending {
	sent_at: Instant,
	timeout: Duration,
	retries_left: u32,
	/// The serialized request, replayable unchanged.
	frames: Vec<Vec<u8>>,
	handler: Box<dyn FnOnce(Vec<u8>) + Send>,
}

pub struct Backend {
	socket: zmq::Socket,
	outstanding: HashMap<u32, Pending>,
	options: RetryOptions,
	update_handler: Option<Box<dyn FnMut(Message) + Send>>,
	abandoned_handler: Option<Box<dyn FnMut(u32) + Send>>,
}

impl Backend {
	pub fn connect(context: &zmq::Context, endpoint: &str) -> anyhow::Result<Self> {
		Self::connect_with_options(context, endpoint, RetryOptions::default())
	}

	pub fn connect_with_options(
		context: &zmq::Context,
		endpoint: &str,
		options: RetryOptions,
	) -> anyhow::Result<Self> {
		let socket = context.socket(zmq::DEALER)?;
		// Don't wait for undelivered requests at close time.
		socket.set_linger(0)?;
		socket.connect(endpoint)?;

		Ok(Backend {
			socket,
			outstanding: HashMap::new(),
			options,
			update_handler: None,
			abandoned_handler: None,
		})
	}

	/// Invoked with messages whose correlation id matches no outstanding
	/// request: subscription notifications.
	pub fn set_update_handler(&mut self, handler: impl FnMut(Message) + Send + 'static) {
		self.update_handler = Some(Box::new(handler));
	}

	/// Invoked once per request that exhausts its retries.
	pub fn set_abandoned_handler(&mut self, handler: impl FnMut(u32) + Send + 'static) {
		self.abandoned_handler = Some(Box::new(handler));
	}

	pub fn pending_requests(&self) -> usize {
		self.outstanding.len()
	}

	/// Send a request and register its continuation. The correlation id is
	/// drawn uniformly and never collides with an outstanding one.
	pub fn request(
		&mut self,
		command: &str,
		data: Vec<u8>,
		handler: impl FnOnce(Vec<u8>) + Send + 'static,
	) -> anyhow::Result<u32> {
		let id = loop {
			let id = rand::random::<u32>();
			if !self.outstanding.contains_key(&id) {
				break id
			}
		};

		let frames = Message::request(command, id, data).to_frames();
		self.socket.send_multipart(frames.clone(), 0)?;
		trace!("Sent {command} [{id:08x}]");

		self.outstanding.insert(
			id,
			Pending {
				sent_at: Instant::now(),
				timeout: self.options.timeout,
				retries_left: self.options.retries,
				frames,
				handler: Box::new(handler),
			},
		);
		Ok(id)
	}

	/// Drive the engine: deliver any ready responses, then resend whatever
	/// has expired. Call from one thread only.
	pub fn poll(&mut self) -> anyhow::Result<()> {
		while self.socket.poll(zmq::POLLIN, 0)? > 0 {
			let frames = receive_multipart(&self.socket)?;
			match Message::from_frames(frames, false) {
				Ok(message) => self.process(message),
				Err(error) => warn!("Discarding an undecodable message: {error}"),
			}
		}
		self.resend_expired();
		Ok(())
	}

	fn process(&mut self, message: Message) {
		match self.outstanding.remove(&message.id) {
			Some(pending) => {
				trace!("Response for {} [{:08x}]", message.command, message.id);
				(pending.handler)(message.data);
			},
			None => match &mut self.update_handler {
				Some(handler) => handler(message),
				None => trace!("Unsolicited {} [{:08x}]", message.command, message.id),
			},
		}
	}

	fn resend_expired(&mut self) {
		let now = Instant::now();
		let mut abandoned = vec![];

		for (id, pending) in self.outstanding.iter_mut() {
			if now.duration_since(pending.sent_at) < pending.timeout {
				continue
			}
			if pending.retries_left == 0 {
				abandoned.push(*id);
				continue
			}

			pending.timeout *= 2;
			pending.retries_left -= 1;
			pending.sent_at = now;

			// A transport error counts as another missed response; the
			// retry loop subsumes it.
			if let Err(error) = self.socket.send_multipart(pending.frames.clone(), 0) {
				warn!("Resend failed for [{id:08x}]: {error}");
			} else {
				trace!("Resent [{id:08x}], {} retries left", pending.retries_left);
			}
		}

		for id in abandoned {
			warn!("Abandoning request [{id:08x}]: retries exhausted");
			self.outstanding.remove(&id);
			if let Some(handler) = &mut self.abandoned_handler {
				handler(id);
			}
		}
	}
}

//! The query worker pool: consume requests from the internal fan-out
//! dealer, dispatch by command name, and queue responses back through the
//! service. Handlers may complete asynchronously; the reply path is a
//! value (`QuerySender`) they carry into their continuation.

use std::{
	collections::HashMap,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, RwLock,
	},
	thread::JoinHandle,
	time::Duration,
};

use gateway_protocol::{receive_multipart, DecodeError, ErrorCode, Message};
use tracing::{debug, error, info_span, trace, warn};

use crate::{auth::DO_NOT_LINGER, services::query::QueryService};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

type CommandHandler = Arc<dyn Fn(Message, QuerySender) + Send + Sync>;

/// Queues one outgoing message to a worker's reply endpoint. Cheap to
/// clone into async continuations; each send opens a fresh inproc PUSH so
/// no socket is ever shared across threads.
#[derive(Clone)]
pub struct QuerySender {
	context: zmq::Context,
	endpoint: String,
}

impl QuerySender {
	pub fn new(context: zmq::Context, endpoint: String) -> Self {
		QuerySender { context, endpoint }
	}

	pub fn send(&self, message: Message) {
		let socket = match self.context.socket(zmq::PUSH) {
			Ok(socket) => socket,
			Err(error) => {
				warn!("Failed to open a reply socket: {error}");
				return
			},
		};

		if let Err(error) =
			socket.connect(&self.endpoint).and_then(|()| message.send(&socket))
		{
			warn!("Failed to queue a reply to {}: {error}", self.endpoint);
		}
	}
}

pub struct QueryWorker {
	context: zmq::Context,
	secure: bool,
	handlers: Arc<RwLock<HashMap<String, CommandHandler>>>,
	stop: Arc<AtomicBool>,
	threads: Vec<JoinHandle<()>>,
}

impl QueryWorker {
	pub fn new(context: zmq::Context, secure: bool) -> Self {
		QueryWorker {
			context,
			secure,
			handlers: Default::default(),
			stop: Arc::new(AtomicBool::new(false)),
			threads: vec![],
		}
	}

	/// Register a handler for a command. Duplicate registration overwrites.
	pub fn attach(
		&self,
		command: &str,
		handler: impl Fn(Message, QuerySender) + Send + Sync + 'static,
	) {
		self.handlers
			.write()
			.expect("unpoisoned")
			.insert(command.to_owned(), Arc::new(handler));
	}

	/// Spawn `count` worker threads against the service's fan-out endpoint.
	pub fn start(&mut self, count: usize) -> anyhow::Result<()> {
		if !self.threads.is_empty() {
			return Ok(())
		}
		self.stop.store(false, Ordering::Relaxed);

		for index in 0..count {
			let dealer = self.context.socket(zmq::DEALER)?;
			dealer.set_linger(DO_NOT_LINGER)?;
			dealer.connect(QueryService::worker_endpoint(self.secure))?;

			let reply_endpoint = reply_endpoint(self.secure, index);
			let replies = self.context.socket(zmq::PULL)?;
			replies.set_linger(DO_NOT_LINGER)?;
			replies.bind(&reply_endpoint)?;

			let sender = QuerySender::new(self.context.clone(), reply_endpoint);
			let handlers = self.handlers.clone();
			let stop = self.stop.clone();
			let secure = self.secure;

			self.threads.push(std::thread::spawn(move || {
				let span = info_span!("query-worker", index, secure);
				let _entered = span.enter();
				work(dealer, replies, handlers, sender, stop, secure);
			}));
		}
		Ok(())
	}

	/// Idempotent; signals every worker loop and joins the threads.
	pub fn stop(&mut self) {
		self.stop.store(true, Ordering::Relaxed);
		for thread in self.threads.drain(..) {
			let _ = thread.join();
		}
	}
}

impl Drop for QueryWorker {
	fn drop(&mut self) {
		self.stop();
	}
}

fn reply_endpoint(secure: bool, index: usize) -> String {
	format!("inproc://query-replies{}-{index}", if secure { "-secure" } else { "" })
}

fn work(
	dealer: zmq::Socket,
	replies: zmq::Socket,
	handlers: Arc<RwLock<HashMap<String, CommandHandler>>>,
	sender: QuerySender,
	stop: Arc<AtomicBool>,
	secure: bool,
) {
	loop {
		if stop.load(Ordering::Relaxed) {
			break
		}

		let (request_ready, reply_ready) = {
			let mut items = [dealer.as_poll_item(zmq::POLLIN), replies.as_poll_item(zmq::POLLIN)];
			match zmq::poll(&mut items, POLL_TIMEOUT.as_millis() as i64) {
				Ok(0) => continue,
				Ok(_) => (items[0].is_readable(), items[1].is_readable()),
				Err(error) => {
					debug!("Worker poll ended: {error}");
					break
				},
			}
		};

		// Completed replies flow back out through the dealer.
		if reply_ready {
			match receive_multipart(&replies) {
				Ok(frames) =>
					if let Err(error) = dealer.send_multipart(frames, 0) {
						warn!("Failed to return a reply: {error}");
					},
				Err(error) => warn!("Failed to collect a reply: {error}"),
			}
		}

		if request_ready {
			match receive_multipart(&dealer) {
				Ok(frames) => receive(frames, &handlers, &sender, secure),
				Err(error) => warn!("Failed to receive a request: {error}"),
			}
		}
	}
}

fn receive(
	frames: Vec<Vec<u8>>,
	handlers: &RwLock<HashMap<String, CommandHandler>>,
	sender: &QuerySender,
	secure: bool,
) {
	match Message::from_frames(frames, secure) {
		Ok(request) => dispatch(request, handlers, sender),
		Err(DecodeError::CorrelationId { route, command }) => {
			// The command frame survived; echo bad_stream with a zero id.
			warn!("Malformed correlation id for {command} from {}", route.display());
			sender.send(Message {
				route,
				command,
				id: 0,
				data: ErrorCode::BadStream.to_bytes().to_vec(),
			});
		},
		Err(error) => warn!("Dropping an undecodable request: {error}"),
	}
}

fn dispatch(
	request: Message,
	handlers: &RwLock<HashMap<String, CommandHandler>>,
	sender: &QuerySender,
) {
	let handler = handlers.read().expect("unpoisoned").get(&request.command).cloned();

	match handler {
		Some(handler) => {
			trace!("Dispatching {} [{:08x}]", request.command, request.id);
			let command = request.command.clone();
			if catch_unwind(AssertUnwindSafe(|| handler(request, sender.clone()))).is_err() {
				// The worker must survive a faulty handler.
				error!("Handler for {command} panicked");
			}
		},
		None => {
			debug!("Unknown command: {}", request.command);
			sender.send(Message::error(&request, ErrorCode::NotFound));
		},
	}
}

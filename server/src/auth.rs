//! Implements a ZAP (ZeroMQ Authentication Protocol) handler.
//! For details, see https://rfc.zeromq.org/spec/27.
//! One handler thread serves every bound socket: source addresses are
//! checked against the deny list, then the allow list, and CURVE
//! credentials against the configured client keys.

use std::{
	net::IpAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread::JoinHandle,
	time::Duration,
};

use anyhow::Context;
use tracing::{debug, info, trace, warn};

use crate::settings;

/// These values are ZMQ convention.
const ZAP_AUTH_SUCCESS: &str = "200";
const ZAP_AUTH_FAILURE: &str = "400";

/// The ZAP specification requires the handler to listen here.
const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";

/// An argument to set_linger on a socket that ensures we don't attempt to
/// deliver pending messages before destroying the socket.
pub const DO_NOT_LINGER: i32 = 0;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Authenticator {
	server_secret_key: Option<[u8; 32]>,
	allowed_keys: Vec<[u8; 32]>,
	allowed_addresses: Vec<IpAddr>,
	denied_addresses: Vec<IpAddr>,
}

impl Authenticator {
	pub fn new(settings: &settings::Server) -> anyhow::Result<Self> {
		let server_secret_key = settings
			.server_private_key
			.as_deref()
			.map(decode_z85_key)
			.transpose()
			.context("Invalid server_private_key")?;

		let allowed_keys = settings
			.client_public_keys
			.iter()
			.map(|key| decode_z85_key(key))
			.collect::<anyhow::Result<Vec<_>>>()
			.context("Invalid client_public_keys entry")?;

		Ok(Authenticator {
			server_secret_key,
			allowed_keys,
			allowed_addresses: parse_addresses(&settings.client_addresses)
				.context("Invalid client_addresses entry")?,
			denied_addresses: parse_addresses(&settings.blacklists)
				.context("Invalid blacklists entry")?,
		})
	}

	/// Apply access control to a socket about to be bound. Secure sockets
	/// get the curve server role; configuring one without a server key is
	/// an error.
	pub fn apply(&self, socket: &zmq::Socket, domain: &str, secure: bool) -> anyhow::Result<()> {
		socket.set_zap_domain(domain)?;

		if secure {
			let key = self
				.server_secret_key
				.as_ref()
				.context("A secure endpoint requires server_private_key")?;
			socket.set_curve_server(true)?;
			socket.set_curve_secretkey(key)?;
		}
		Ok(())
	}

	/// The access decision: deny list first, then the allow list (when
	/// non-empty), then CURVE credentials (when a key list is configured).
	fn authorize(&self, address: &str, mechanism: &str, credential: Option<&[u8]>) -> bool {
		if let Ok(source) = address.parse::<IpAddr>() {
			if self.denied_addresses.contains(&source) {
				return false
			}
			if !self.allowed_addresses.is_empty() && !self.allowed_addresses.contains(&source) {
				return false
			}
		} else if !self.denied_addresses.is_empty() || !self.allowed_addresses.is_empty() {
			// Unparsable source with filtering configured: reject.
			return false
		}

		if mechanism == "CURVE" && !self.allowed_keys.is_empty() {
			return match credential {
				Some(key) if key.len() == 32 =>
					self.allowed_keys.iter().any(|allowed| allowed[..] == *key),
				_ => false,
			}
		}

		true
	}

	/// This implements the core of the ZAP protocol: parses an
	/// authentication request and provides a response.
	fn process_authentication_request(&self, socket: &zmq::Socket, request: Vec<Vec<u8>>) {
		// NULL requests have 6 parts, CURVE requests carry the client key
		// as a seventh.
		if request.len() < 6 || request[0] != b"1.0" {
			warn!("Ignoring a malformed ZAP request with {} parts", request.len());
			return
		}

		let request_id = &request[1];
		let address = String::from_utf8_lossy(&request[3]);
		let mechanism = String::from_utf8_lossy(&request[5]);
		let credential = request.get(6).map(|frame| frame.as_slice());

		let allowed = self.authorize(&address, &mechanism, credential);
		if allowed {
			trace!("Allowing an incoming {mechanism} connection from {address}");
		} else {
			warn!("Declining an incoming {mechanism} connection from {address}");
		}

		let user_id = credential.map(hex::encode).unwrap_or_default();
		let status = if allowed { ZAP_AUTH_SUCCESS } else { ZAP_AUTH_FAILURE };

		if let Err(error) = socket.send_multipart(
			[
				b"1.0".to_vec(),
				request_id.clone(),
				status.as_bytes().to_vec(),
				vec![],
				user_id.into_bytes(),
				vec![],
			],
			0,
		) {
			warn!("Failed to send a ZAP response: {error}");
		}
	}
}

pub struct AuthenticatorHandle {
	stop: Arc<AtomicBool>,
	thread: Option<JoinHandle<()>>,
}

impl AuthenticatorHandle {
	pub fn stop(&mut self) {
		self.stop.store(true, Ordering::Relaxed);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for AuthenticatorHandle {
	fn drop(&mut self) {
		self.stop();
	}
}

pub fn start_authentication_thread(
	context: zmq::Context,
	authenticator: Arc<Authenticator>,
) -> anyhow::Result<AuthenticatorHandle> {
	// Note ZMQ implements the REQ side of this socket internally.
	let zap_socket = context.socket(zmq::REP)?;
	zap_socket.set_linger(DO_NOT_LINGER)?;
	zap_socket.set_rcvtimeo(RECEIVE_TIMEOUT.as_millis() as i32)?;
	zap_socket.bind(ZAP_ENDPOINT).context("Failed to bind the ZAP endpoint")?;

	let stop = Arc::new(AtomicBool::new(false));

	let thread = std::thread::spawn({
		let stop = stop.clone();
		move || {
			info!("Started authentication thread");
			loop {
				match zap_socket.recv_multipart(0) {
					Ok(request) =>
						authenticator.process_authentication_request(&zap_socket, request),
					Err(zmq::Error::EAGAIN) => {},
					Err(error) => {
						debug!("Authentication thread exiting: {error}");
						break
					},
				}
				if stop.load(Ordering::Relaxed) {
					break
				}
			}
		}
	});

	Ok(AuthenticatorHandle { stop, thread: Some(thread) })
}

fn decode_z85_key(encoded: &str) -> anyhow::Result<[u8; 32]> {
	let bytes = zmq::z85_decode(encoded).context("Key is not valid Z85")?;
	bytes.try_into().map_err(|_| anyhow::anyhow!("Key must decode to 32 bytes"))
}

fn parse_addresses(addresses: &[String]) -> anyhow::Result<Vec<IpAddr>> {
	addresses
		.iter()
		.map(|address| {
			address.parse().with_context(|| format!("Not an IP address: {address}"))
		})
		.collect()
}

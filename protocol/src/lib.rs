//! Wire protocol shared by the gateway server and its clients: the framed
//! request/response envelope, routing identifiers, binary prefixes and the
//! fixed-width result rows carried inside query payloads.

pub mod commands;
mod error;
mod message;
mod prefix;
mod route;
mod rows;

pub use error::ErrorCode;
pub use message::{DecodeError, Message};
pub use prefix::Prefix;
pub use route::Route;
pub use rows::{HistoryRow, StealthRow, HISTORY_ROW_SIZE, STEALTH_ROW_SIZE};

/// Size of the correlation id frame. Requests with any other size are
/// rejected as malformed.
pub const CORRELATION_ID_SIZE: usize = 4;

/// Tag byte selecting what a subscription matches against: standard
/// payment address hashes or transaction stealth prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
	Address = 0,
	Stealth = 1,
}

impl SubscriptionKind {
	pub fn from_byte(byte: u8) -> Option<Self> {
		match byte {
			0 => Some(SubscriptionKind::Address),
			1 => Some(SubscriptionKind::Stealth),
			_ => None,
		}
	}

	/// Widest meaningful prefix per kind: the payment address hash width,
	/// or the full stealth field.
	pub fn maximum_bits(self) -> u16 {
		match self {
			SubscriptionKind::Address => 160,
			SubscriptionKind::Stealth => 256,
		}
	}
}

/// Collects a whole multipart message, blocking until the final part.
pub fn receive_multipart(socket: &zmq::Socket) -> zmq::Result<Vec<Vec<u8>>> {
	let mut parts = vec![];

	loop {
		let part = socket.recv_bytes(0)?;
		parts.push(part);

		if !socket.get_rcvmore()? {
			break
		}
	}
	Ok(parts)
}

use crate::{ErrorCode, Route, CORRELATION_ID_SIZE};

/// One framed request, response or notification.
///
/// On the wire this is a multipart message of 3, 4 or 5 frames:
///
/// 1. routing identifier (optional, assigned by the ROUTER)
/// 2. empty delimiter (optional, echoed if present on receive)
/// 3. command (utf-8)
/// 4. correlation id (4 bytes little-endian, chosen by the client)
/// 5. payload (command defined)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub route: Route,
	pub command: String,
	pub id: u32,
	pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("unexpected frame count: {0}")]
	FrameCount(usize),
	#[error("command frame is not valid utf-8")]
	Command,
	#[error("correlation id frame is not 4 bytes (command: {command})")]
	CorrelationId { route: Route, command: String },
}

impl Message {
	/// A request as built by a client (no routing identifier yet).
	pub fn request(command: &str, id: u32, data: Vec<u8>) -> Self {
		Message { route: Route::default(), command: command.to_owned(), id, data }
	}

	/// A pure-error response to the given request.
	pub fn error(request: &Message, code: ErrorCode) -> Self {
		Message {
			route: request.route.clone(),
			command: request.command.clone(),
			id: request.id,
			data: code.to_bytes().to_vec(),
		}
	}

	/// A successful response: 4 bytes of `Success` followed by the body.
	pub fn result(request: &Message, body: &[u8]) -> Self {
		let mut data = Vec::with_capacity(CORRELATION_ID_SIZE + body.len());
		data.extend_from_slice(&ErrorCode::Success.to_bytes());
		data.extend_from_slice(body);
		Message { route: request.route.clone(), command: request.command.clone(), id: request.id, data }
	}

	/// A notification for a subscription route. The correlation id is the
	/// one the client used when it subscribed.
	pub fn notification(route: Route, command: &str, id: u32, data: Vec<u8>) -> Self {
		Message { route, command: command.to_owned(), id, data }
	}

	/// Serialize to frames in wire order. The routing identifier is written
	/// only when present and the delimiter only when the request carried one.
	pub fn to_frames(&self) -> Vec<Vec<u8>> {
		let mut frames = Vec::with_capacity(5);
		if !self.route.address.is_empty() {
			frames.push(self.route.address.clone());
		}
		if self.route.delimited {
			frames.push(vec![]);
		}
		frames.push(self.command.as_bytes().to_vec());
		frames.push(self.id.to_le_bytes().to_vec());
		frames.push(self.data.clone());
		frames
	}

	/// Parse a received multipart message. Accepts exactly 3, 4 or 5 frames;
	/// a 5 frame message must carry an empty delimiter in second position.
	pub fn from_frames(mut frames: Vec<Vec<u8>>, secure: bool) -> Result<Self, DecodeError> {
		let route = match frames.len() {
			5 => {
				if !frames[1].is_empty() {
					return Err(DecodeError::FrameCount(frames.len()))
				}
				let address = frames.remove(0);
				frames.remove(0);
				Route::new(secure, true, address)
			},
			4 => Route::new(secure, false, frames.remove(0)),
			3 => Route::new(secure, false, vec![]),
			count => return Err(DecodeError::FrameCount(count)),
		};

		let command =
			String::from_utf8(frames.remove(0)).map_err(|_| DecodeError::Command)?;

		let raw_id: [u8; CORRELATION_ID_SIZE] = frames[0]
			.as_slice()
			.try_into()
			.map_err(|_| DecodeError::CorrelationId { route: route.clone(), command: command.clone() })?;
		frames.remove(0);

		Ok(Message { route, command, id: u32::from_le_bytes(raw_id), data: frames.remove(0) })
	}

	pub fn send(&self, socket: &zmq::Socket) -> zmq::Result<()> {
		socket.send_multipart(self.to_frames(), 0)
	}
}

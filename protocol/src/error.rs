/// Error taxonomy carried as the leading 4 little-endian bytes of every
/// response payload. A payload of exactly 4 bytes is a pure-error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
	Success = 0,
	BadStream = 1,
	NotFound = 2,
	OversubscribedLimit = 3,
	ServiceStopped = 4,
	ChannelStopped = 5,
	InvalidArgument = 6,
}

impl ErrorCode {
	pub fn to_bytes(self) -> [u8; 4] {
		(self as u32).to_le_bytes()
	}

	/// Unknown values map to `InvalidArgument` so that a newer server never
	/// panics an older client.
	pub fn from_u32(value: u32) -> Self {
		match value {
			0 => ErrorCode::Success,
			1 => ErrorCode::BadStream,
			2 => ErrorCode::NotFound,
			3 => ErrorCode::OversubscribedLimit,
			4 => ErrorCode::ServiceStopped,
			5 => ErrorCode::ChannelStopped,
			_ => ErrorCode::InvalidArgument,
		}
	}

	pub fn from_bytes(bytes: [u8; 4]) -> Self {
		Self::from_u32(u32::from_le_bytes(bytes))
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?} ({})", self, *self as u32)
	}
}

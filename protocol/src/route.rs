/// Identifies a client at the transport layer. The address is the opaque
/// identity the ROUTER socket assigned to the connection (zeromq uses 5
/// bytes); the delimiter flag records whether the client framed its request
/// with an empty delimiter (REQ and delimited DEALER clients do, bare
/// DEALER clients do not) so that replies can echo the same shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Route {
	pub secure: bool,
	pub delimited: bool,
	pub address: Vec<u8>,
}

impl Route {
	pub fn new(secure: bool, delimited: bool, address: Vec<u8>) -> Self {
		Route { secure, delimited, address }
	}

	/// A printable address for logging only.
	pub fn display(&self) -> String {
		format!("[{}]{}", hex::encode(&self.address), if self.delimited { "[]" } else { "" })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_renders_hex_and_delimiter() {
		let route = Route::new(false, true, vec![0xAB, 0xCD]);
		assert_eq!(route.display(), "[abcd][]");
		assert_eq!(Route::default().display(), "[]");
	}

	#[test]
	fn equality_covers_all_three_fields() {
		let route = Route::new(false, false, vec![1, 2, 3]);
		assert_ne!(route, Route::new(true, false, vec![1, 2, 3]));
		assert_ne!(route, Route::new(false, true, vec![1, 2, 3]));
		assert_ne!(route, Route::new(false, false, vec![1, 2]));
		assert_eq!(route, Route::new(false, false, vec![1, 2, 3]));
	}
}

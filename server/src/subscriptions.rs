//! Address and stealth-prefix subscriptions: one bounded set keyed by
//! `(route, kind)`, guarded by a single mutex. Confirmed and pool-accepted
//! transactions are submitted here and fan out as notifications through
//! the query service's notification endpoint.

use std::{
	collections::HashMap,
	sync::Mutex,
	time::{Duration, Instant},
};

use bitcoin::{consensus, hashes::Hash, BlockHash, Transaction};
use gateway_protocol::{commands, ErrorCode, Message, Prefix, Route, SubscriptionKind};
use tracing::{debug, trace, warn};

use crate::{scripts, workers::QuerySender};

struct Subscription {
	/// The correlation id the client first subscribed with; sent on every
	/// notification.
	id: u32,
	prefix: Prefix,
	/// Monotonically non-decreasing; advanced on renew.
	updated_at: Instant,
	/// Send attempts, wrapping.
	sequence: u16,
}

pub struct SubscriptionManager {
	subscriptions: Mutex<HashMap<(Route, SubscriptionKind), Subscription>>,
	limit: usize,
	expiration: Duration,
	public_sender: QuerySender,
	secure_sender: Option<QuerySender>,
}

impl SubscriptionManager {
	pub fn new(
		limit: usize,
		expiration: Duration,
		public_sender: QuerySender,
		secure_sender: Option<QuerySender>,
	) -> Self {
		SubscriptionManager {
			subscriptions: Default::default(),
			limit,
			expiration,
			public_sender,
			secure_sender,
		}
	}

	pub fn len(&self) -> usize {
		self.subscriptions.lock().expect("unpoisoned").len()
	}

	/// Insert or replace the subscription for the request's route.
	pub fn subscribe(&self, request: &Message) -> ErrorCode {
		let (kind, prefix) = match parse_subscription(&request.data) {
			Ok(parsed) => parsed,
			Err(code) => return code,
		};

		let mut subscriptions = self.subscriptions.lock().expect("unpoisoned");
		let key = (request.route.clone(), kind);
		if !subscriptions.contains_key(&key) && subscriptions.len() >= self.limit {
			return ErrorCode::OversubscribedLimit
		}

		trace!("Subscribing {} to {:?} updates", request.route.display(), kind);
		subscriptions.insert(
			key,
			Subscription { id: request.id, prefix, updated_at: Instant::now(), sequence: 0 },
		);
		ErrorCode::Success
	}

	/// Refresh the expiry clock of an existing subscription. Never creates
	/// an entry.
	pub fn renew(&self, request: &Message) -> ErrorCode {
		let (kind, _) = match parse_subscription(&request.data) {
			Ok(parsed) => parsed,
			Err(code) => return code,
		};

		match self
			.subscriptions
			.lock()
			.expect("unpoisoned")
			.get_mut(&(request.route.clone(), kind))
		{
			Some(subscription) => {
				subscription.updated_at = Instant::now();
				ErrorCode::Success
			},
			None => ErrorCode::NotFound,
		}
	}

	pub fn unsubscribe(&self, request: &Message) -> ErrorCode {
		let (kind, _) = match parse_subscription(&request.data) {
			Ok(parsed) => parsed,
			Err(code) => return code,
		};

		match self
			.subscriptions
			.lock()
			.expect("unpoisoned")
			.remove(&(request.route.clone(), kind))
		{
			Some(_) => ErrorCode::Success,
			None => ErrorCode::NotFound,
		}
	}

	/// Match one confirmed or pool-accepted transaction against the set
	/// and post a notification for every hit. The mutex is held for the
	/// duration of the scan.
	pub fn submit(&self, height: u32, block_hash: &BlockHash, transaction: &Transaction) {
		let payment_outputs: Vec<(u8, [u8; 20])> = transaction
			.output
			.iter()
			.filter_map(|output| scripts::payment_address_hash(&output.script_pubkey))
			.collect();
		let stealth_prefix = scripts::transaction_stealth_prefix(transaction);

		if payment_outputs.is_empty() && stealth_prefix.is_none() {
			return
		}

		let serialized = consensus::serialize(transaction);
		let mut subscriptions = self.subscriptions.lock().expect("unpoisoned");

		for ((route, kind), subscription) in subscriptions.iter_mut() {
			match kind {
				SubscriptionKind::Address =>
					for (version, hash) in &payment_outputs {
						// One notification per matching output.
						if subscription.prefix.matches(hash) {
							self.post_updates(
								route,
								subscription,
								*version,
								hash,
								height,
								block_hash,
								&serialized,
							);
						}
					},
				SubscriptionKind::Stealth =>
					if let Some(prefix) = stealth_prefix {
						if subscription.prefix.matches(&prefix) {
							self.post_stealth_updates(
								route,
								subscription,
								&prefix,
								height,
								block_hash,
								&serialized,
							);
						}
					},
			}
		}
	}

	/// Remove every subscription whose renewal is older than the
	/// expiration cut-off. Expiry is silent: clients renew on their own
	/// cadence.
	pub fn sweep(&self) {
		let mut subscriptions = self.subscriptions.lock().expect("unpoisoned");
		let before = subscriptions.len();
		subscriptions
			.retain(|_, subscription| subscription.updated_at.elapsed() < self.expiration);

		let swept = before - subscriptions.len();
		if swept > 0 {
			debug!("Swept {swept} expired subscriptions ({} remain)", subscriptions.len());
		}
	}

	fn post_updates(
		&self,
		route: &Route,
		subscription: &mut Subscription,
		version: u8,
		hash: &[u8; 20],
		height: u32,
		block_hash: &BlockHash,
		transaction: &[u8],
	) {
		// [ code:4 ] [ version:1 ] [ hash:20 ] [ height:4 ] [ block_hash:32 ] [ tx ]
		let mut data = Vec::with_capacity(61 + transaction.len());
		data.extend_from_slice(&ErrorCode::Success.to_bytes());
		data.push(version);
		data.extend_from_slice(hash);
		data.extend_from_slice(&height.to_le_bytes());
		data.extend_from_slice(&block_hash.to_byte_array());
		data.extend_from_slice(transaction);

		self.post(route, subscription, commands::ADDRESS_UPDATE, data);
	}

	fn post_stealth_updates(
		&self,
		route: &Route,
		subscription: &mut Subscription,
		prefix: &[u8; 4],
		height: u32,
		block_hash: &BlockHash,
		transaction: &[u8],
	) {
		// [ code:4 ] [ prefix:4 ] [ height:4 ] [ block_hash:32 ] [ tx ]
		let mut data = Vec::with_capacity(44 + transaction.len());
		data.extend_from_slice(&ErrorCode::Success.to_bytes());
		data.extend_from_slice(prefix);
		data.extend_from_slice(&height.to_le_bytes());
		data.extend_from_slice(&block_hash.to_byte_array());
		data.extend_from_slice(transaction);

		self.post(route, subscription, commands::STEALTH_UPDATE, data);
	}

	fn post(&self, route: &Route, subscription: &mut Subscription, command: &str, data: Vec<u8>) {
		let sender = if route.secure {
			match &self.secure_sender {
				Some(sender) => sender,
				None => {
					warn!("No secure notification path for {}", route.display());
					return
				},
			}
		} else {
			&self.public_sender
		};

		subscription.sequence = subscription.sequence.wrapping_add(1);
		sender.send(Message::notification(route.clone(), command, subscription.id, data));
	}
}

/// Parse `kind:1 bits:1 blocks:⌈bits/8⌉`.
fn parse_subscription(data: &[u8]) -> Result<(SubscriptionKind, Prefix), ErrorCode> {
	if data.len() < 2 {
		return Err(ErrorCode::BadStream)
	}

	let kind = SubscriptionKind::from_byte(data[0]).ok_or(ErrorCode::InvalidArgument)?;
	let bits = u16::from(data[1]);
	if bits > kind.maximum_bits() {
		return Err(ErrorCode::InvalidArgument)
	}

	let prefix =
		Prefix::new(bits, data[2..].to_vec()).ok_or(ErrorCode::BadStream)?;
	Ok((kind, prefix))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use bitcoin::hashes::Hash;
	use gateway_protocol::receive_multipart;

	use super::*;
	use crate::node::memory::test_utils::{pay_to_hash_transaction, stealth_transaction};

	/// A manager wired to a PULL socket the test reads notifications from.
	fn harness(limit: usize, expiration: Duration) -> (Arc<SubscriptionManager>, zmq::Socket) {
		static NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
		let endpoint = format!(
			"inproc://subscription-tests-{}",
			NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
		);

		let context = zmq::Context::new();
		let pull = context.socket(zmq::PULL).unwrap();
		pull.bind(&endpoint).unwrap();
		pull.set_rcvtimeo(2_000).unwrap();

		let manager = Arc::new(SubscriptionManager::new(
			limit,
			expiration,
			QuerySender::new(context, endpoint),
			None,
		));
		(manager, pull)
	}

	fn subscribe_request(route_address: &[u8], id: u32, kind: u8, bits: u8, blocks: &[u8]) -> Message {
		let mut data = vec![kind, bits];
		data.extend_from_slice(blocks);
		Message {
			route: Route::new(false, false, route_address.to_vec()),
			command: commands::SUBSCRIBE.to_string(),
			id,
			data,
		}
	}

	#[test]
	fn subscribe_then_update_delivers_a_notification() {
		let (manager, pull) = harness(100, Duration::from_secs(600));

		let request = subscribe_request(&[1, 2, 3, 4, 5], 0x0000_0001, 0, 8, &[0xAB]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);

		let mut hash = [0u8; 20];
		hash[0] = 0xAB;
		let transaction = pay_to_hash_transaction(hash, 10_000);
		let block_hash = BlockHash::all_zeros();
		manager.submit(500, &block_hash, &transaction);

		let frames = receive_multipart(&pull).unwrap();
		let notification = Message::from_frames(frames, false).unwrap();
		assert_eq!(notification.command, commands::ADDRESS_UPDATE);
		assert_eq!(notification.id, 0x0000_0001);
		assert_eq!(notification.route.address, vec![1, 2, 3, 4, 5]);

		// code + version + hash + height + block hash + tx
		assert_eq!(&notification.data[..4], &ErrorCode::Success.to_bytes()[..]);
		assert_eq!(notification.data[4], crate::PAY_TO_PUBKEY_HASH_VERSION);
		assert_eq!(&notification.data[5..25], &hash[..]);
		assert_eq!(&notification.data[25..29], &500u32.to_le_bytes()[..]);
		assert_eq!(&notification.data[29..61], &block_hash.to_byte_array()[..]);
		assert_eq!(&notification.data[61..], &consensus::serialize(&transaction)[..]);
	}

	#[test]
	fn non_matching_outputs_stay_silent() {
		let (manager, pull) = harness(100, Duration::from_secs(600));
		pull.set_rcvtimeo(200).unwrap();

		let request = subscribe_request(&[7; 5], 9, 0, 16, &[0xAA, 0xBB]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);

		manager.submit(1, &BlockHash::all_zeros(), &pay_to_hash_transaction([0x11; 20], 5));
		assert!(receive_multipart(&pull).is_err());
	}

	#[test]
	fn stealth_subscriptions_match_the_transaction_prefix() {
		let (manager, pull) = harness(100, Duration::from_secs(600));

		let transaction = stealth_transaction([5; 32], [6; 20], 2_000);
		let prefix = scripts::transaction_stealth_prefix(&transaction).unwrap();

		let request = subscribe_request(&[9; 5], 77, 1, 16, &prefix[..2]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);

		manager.submit(42, &BlockHash::all_zeros(), &transaction);

		let notification =
			Message::from_frames(receive_multipart(&pull).unwrap(), false).unwrap();
		assert_eq!(notification.command, commands::STEALTH_UPDATE);
		assert_eq!(notification.id, 77);
		assert_eq!(&notification.data[4..8], &prefix[..]);
	}

	#[test]
	fn the_set_is_bounded_by_the_subscription_limit() {
		let (manager, _pull) = harness(2, Duration::from_secs(600));

		for index in 0u8..2 {
			let request = subscribe_request(&[index; 5], index.into(), 0, 0, &[]);
			assert_eq!(manager.subscribe(&request), ErrorCode::Success);
		}
		assert_eq!(manager.len(), 2);

		let request = subscribe_request(&[9; 5], 9, 0, 0, &[]);
		assert_eq!(manager.subscribe(&request), ErrorCode::OversubscribedLimit);

		// Re-subscribing an existing route replaces rather than grows.
		let request = subscribe_request(&[0; 5], 10, 0, 0, &[]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);
		assert_eq!(manager.len(), 2);
	}

	#[test]
	fn renew_requires_an_existing_entry() {
		let (manager, _pull) = harness(100, Duration::from_secs(600));

		let request = subscribe_request(&[1; 5], 1, 0, 8, &[0xAA]);
		assert_eq!(manager.renew(&request), ErrorCode::NotFound);

		assert_eq!(manager.subscribe(&request), ErrorCode::Success);
		assert_eq!(manager.renew(&request), ErrorCode::Success);

		// A different kind on the same route is a different entry.
		let stealth = subscribe_request(&[1; 5], 1, 1, 8, &[0xAA]);
		assert_eq!(manager.renew(&stealth), ErrorCode::NotFound);
	}

	#[test]
	fn unsubscribe_removes_and_silences() {
		let (manager, pull) = harness(100, Duration::from_secs(600));
		pull.set_rcvtimeo(200).unwrap();

		let hash = [0xCD; 20];
		let request = subscribe_request(&[2; 5], 5, 0, 8, &[0xCD]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);
		assert_eq!(manager.unsubscribe(&request), ErrorCode::Success);
		assert_eq!(manager.unsubscribe(&request), ErrorCode::NotFound);

		manager.submit(1, &BlockHash::all_zeros(), &pay_to_hash_transaction(hash, 5));
		assert!(receive_multipart(&pull).is_err());
	}

	#[test]
	fn expired_entries_are_swept_and_renewal_fails_afterwards() {
		let (manager, pull) = harness(100, Duration::from_millis(50));
		pull.set_rcvtimeo(200).unwrap();

		let request = subscribe_request(&[3; 5], 6, 0, 16, &[0xAA, 0xBB]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);

		std::thread::sleep(Duration::from_millis(80));
		manager.sweep();
		assert_eq!(manager.len(), 0);
		assert_eq!(manager.renew(&request), ErrorCode::NotFound);

		let mut hash = [0u8; 20];
		hash[0] = 0xAA;
		hash[1] = 0xBB;
		manager.submit(1, &BlockHash::all_zeros(), &pay_to_hash_transaction(hash, 5));
		assert!(receive_multipart(&pull).is_err());
	}

	#[test]
	fn renewal_defers_the_sweep() {
		let (manager, _pull) = harness(100, Duration::from_millis(100));

		let request = subscribe_request(&[4; 5], 8, 0, 0, &[]);
		assert_eq!(manager.subscribe(&request), ErrorCode::Success);

		std::thread::sleep(Duration::from_millis(60));
		assert_eq!(manager.renew(&request), ErrorCode::Success);
		std::thread::sleep(Duration::from_millis(60));
		manager.sweep();
		assert_eq!(manager.len(), 1);
	}

	#[test]
	fn malformed_subscription_payloads_are_rejected() {
		let (manager, _pull) = harness(100, Duration::from_secs(600));

		// Too short.
		let mut request = subscribe_request(&[5; 5], 1, 0, 0, &[]);
		request.data = vec![0];
		assert_eq!(manager.subscribe(&request), ErrorCode::BadStream);

		// Unknown kind.
		assert_eq!(
			manager.subscribe(&subscribe_request(&[5; 5], 1, 7, 0, &[])),
			ErrorCode::InvalidArgument
		);

		// Address prefix wider than the hash.
		assert_eq!(
			manager.subscribe(&subscribe_request(&[5; 5], 1, 0, 161, &[0u8; 21])),
			ErrorCode::InvalidArgument
		);

		// Block bytes not matching the bit length.
		assert_eq!(
			manager.subscribe(&subscribe_request(&[5; 5], 1, 0, 16, &[0xAA])),
			ErrorCode::BadStream
		);
	}
}

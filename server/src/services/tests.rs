//! End to end coverage over loopback sockets: a real server node around
//! the in-memory full node, queried through the client crate.

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::{Duration, Instant},
};

use bitcoin::{consensus, hashes::Hash};
use gateway_client::{interface as client, Backend, RetryOptions};
use gateway_protocol::{commands, ErrorCode, Message, Prefix, SubscriptionKind};

use crate::{
	auth::Authenticator,
	logging::test_utils::init_test_logger,
	node::{
		memory::{test_utils::*, MemoryNode},
		FullNode,
	},
	server::ServerNode,
	services::{
		block::BlockService, heartbeat::HeartbeatService, query::QueryService,
		transaction::TransactionService,
	},
	settings::{self, test_utils::new_test_settings},
	subscriptions::SubscriptionManager,
	workers::{QuerySender, QueryWorker},
};

// Each test gets its own loopback port range to avoid conflicts when the
// suite runs in parallel.
const PORTS_SCENARIOS: u16 = 19000;
const PORTS_QUERIES: u16 = 19010;
const PORTS_SUBSCRIPTIONS: u16 = 19020;
const PORTS_HEARTBEAT: u16 = 19030;
const PORTS_BLOCKS: u16 = 19040;
const PORTS_TRANSACTIONS: u16 = 19050;
const PORTS_RESTART: u16 = 19060;
const PORTS_PANICS: u16 = 19070;

fn fast_options() -> RetryOptions {
	RetryOptions { timeout: Duration::from_secs(2), retries: 1 }
}

async fn drive(backend: &mut Backend, mut done: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(10);
	while !done() {
		assert!(Instant::now() < deadline, "timed out driving the client");
		backend.poll().unwrap();
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

async fn start_server(base_port: u16, node: Arc<MemoryNode>) -> (ServerNode, Backend) {
	init_test_logger();
	let settings = new_test_settings(base_port);
	let mut server = ServerNode::new(settings, node).unwrap();
	server.start().unwrap();

	let context = zmq::Context::new();
	let backend = Backend::connect_with_options(
		&context,
		&format!("tcp://127.0.0.1:{base_port}"),
		fast_options(),
	)
	.unwrap();
	(server, backend)
}

#[tokio::test]
async fn fetch_last_height_and_unknown_commands() {
	let node = Arc::new(MemoryNode::with_chain_height(1500));
	let (mut server, mut backend) = start_server(PORTS_SCENARIOS, node).await;

	// Scenario: happy path. 8 byte payload: success then 1500 LE.
	let response: Arc<Mutex<Option<Vec<u8>>>> = Default::default();
	backend
		.request(commands::FETCH_LAST_HEIGHT, vec![], {
			let response = response.clone();
			move |data| *response.lock().unwrap() = Some(data)
		})
		.unwrap();
	drive(&mut backend, || response.lock().unwrap().is_some()).await;
	assert_eq!(
		response.lock().unwrap().take().unwrap(),
		vec![0x00, 0x00, 0x00, 0x00, 0xDC, 0x05, 0x00, 0x00]
	);

	// Scenario: unknown command. Exactly 4 bytes of not_found.
	let response: Arc<Mutex<Option<Vec<u8>>>> = Default::default();
	backend
		.request("blockchain.gibberish", vec![], {
			let response = response.clone();
			move |data| *response.lock().unwrap() = Some(data)
		})
		.unwrap();
	drive(&mut backend, || response.lock().unwrap().is_some()).await;
	assert_eq!(
		response.lock().unwrap().take().unwrap(),
		ErrorCode::NotFound.to_bytes().to_vec()
	);

	// Malformed payload for a declared-empty request.
	let response: Arc<Mutex<Option<Vec<u8>>>> = Default::default();
	backend
		.request(commands::FETCH_LAST_HEIGHT, vec![0xFF], {
			let response = response.clone();
			move |data| *response.lock().unwrap() = Some(data)
		})
		.unwrap();
	drive(&mut backend, || response.lock().unwrap().is_some()).await;
	assert_eq!(
		response.lock().unwrap().take().unwrap(),
		ErrorCode::BadStream.to_bytes().to_vec()
	);

	server.stop().await;
}

#[tokio::test]
async fn queries_resolve_against_the_chain_and_pool() {
	let node = Arc::new(MemoryNode::new());
	let hash = [0x42; 20];

	let funding = pay_to_hash_transaction(hash, 75_000);
	let funding_txid = funding.compute_txid();
	let (height, block) = node.push_block(vec![funding.clone()]);

	let pooled = pay_to_hash_transaction([0x43; 20], 1_234);
	node.organize(pooled.clone(), false).await.unwrap();
	node.set_connection_count(8);

	let (mut server, mut backend) = start_server(PORTS_QUERIES, node.clone()).await;

	// History: one 88 byte row for the funding output.
	let rows: Arc<Mutex<Option<Result<Vec<_>, ErrorCode>>>> = Default::default();
	client::fetch_history2(&mut backend, 0, hash, None, {
		let rows = rows.clone();
		move |result| *rows.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || rows.lock().unwrap().is_some()).await;
	let rows = rows.lock().unwrap().take().unwrap().unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].output.txid, funding_txid);
	assert_eq!(rows[0].output_height, height);
	assert_eq!(rows[0].value, 75_000);

	// The legacy layout resolves identically.
	let rows: Arc<Mutex<Option<Result<Vec<_>, ErrorCode>>>> = Default::default();
	client::fetch_history(&mut backend, 0, hash, Some(0), {
		let rows = rows.clone();
		move |result| *rows.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || rows.lock().unwrap().is_some()).await;
	assert_eq!(rows.lock().unwrap().take().unwrap().unwrap().len(), 1);

	// Headers by height and by hash.
	let header: Arc<Mutex<Option<Result<_, ErrorCode>>>> = Default::default();
	client::fetch_block_header_by_height(&mut backend, height, {
		let header = header.clone();
		move |result| *header.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || header.lock().unwrap().is_some()).await;
	assert_eq!(header.lock().unwrap().take().unwrap().unwrap(), block.header);

	let header: Arc<Mutex<Option<Result<_, ErrorCode>>>> = Default::default();
	client::fetch_block_header_by_hash(&mut backend, block.header.block_hash(), {
		let header = header.clone();
		move |result| *header.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || header.lock().unwrap().is_some()).await;
	assert_eq!(header.lock().unwrap().take().unwrap().unwrap(), block.header);

	// Transactions: confirmed, pooled, and the confirmation index.
	let fetched: Arc<Mutex<Option<Result<_, ErrorCode>>>> = Default::default();
	client::fetch_transaction(&mut backend, funding_txid, {
		let fetched = fetched.clone();
		move |result| *fetched.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || fetched.lock().unwrap().is_some()).await;
	assert_eq!(fetched.lock().unwrap().take().unwrap().unwrap(), funding);

	let fetched: Arc<Mutex<Option<Result<_, ErrorCode>>>> = Default::default();
	client::pool_fetch_transaction(&mut backend, pooled.compute_txid(), {
		let fetched = fetched.clone();
		move |result| *fetched.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || fetched.lock().unwrap().is_some()).await;
	assert_eq!(fetched.lock().unwrap().take().unwrap().unwrap(), pooled);

	let index: Arc<Mutex<Option<Result<(u32, u32), ErrorCode>>>> = Default::default();
	client::fetch_transaction_index(&mut backend, funding_txid, {
		let index = index.clone();
		move |result| *index.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || index.lock().unwrap().is_some()).await;
	assert_eq!(index.lock().unwrap().take().unwrap().unwrap(), (height, 0));

	// Lookup misses carry not_found.
	let missing: Arc<Mutex<Option<Result<_, ErrorCode>>>> = Default::default();
	client::fetch_transaction(&mut backend, bitcoin::Txid::from_byte_array([9; 32]), {
		let missing = missing.clone();
		move |result| *missing.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || missing.lock().unwrap().is_some()).await;
	assert_eq!(missing.lock().unwrap().take().unwrap(), Err(ErrorCode::NotFound));

	// Broadcast organizes into the pool; validate2 does not.
	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::validate2(&mut backend, &pay_to_hash_transaction([7; 20], 9), {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Ok(()));
	assert_eq!(node.pool_size(), 1);

	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::broadcast(&mut backend, &pay_to_hash_transaction([7; 20], 9), {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Ok(()));
	assert_eq!(node.pool_size(), 2);

	// Peer relay and the connection count.
	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::broadcast_transaction(&mut backend, &pay_to_hash_transaction([8; 20], 10), {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Ok(()));

	let count: Arc<Mutex<Option<Result<u32, ErrorCode>>>> = Default::default();
	client::total_connections(&mut backend, {
		let count = count.clone();
		move |result| *count.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || count.lock().unwrap().is_some()).await;
	assert_eq!(count.lock().unwrap().take().unwrap().unwrap(), 8);

	server.stop().await;
}

#[tokio::test]
async fn subscribe_then_update_reaches_the_client() {
	let node = Arc::new(MemoryNode::new());
	let (mut server, mut backend) = start_server(PORTS_SUBSCRIPTIONS, node.clone()).await;

	let updates: Arc<Mutex<Vec<Message>>> = Default::default();
	backend.set_update_handler({
		let updates = updates.clone();
		move |message| updates.lock().unwrap().push(message)
	});

	// Renewing before subscribing misses.
	let prefix = Prefix::new(8, vec![0xAB]).unwrap();
	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::renew(&mut backend, SubscriptionKind::Address, &prefix, {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Err(ErrorCode::NotFound));

	// Subscribe to the 0xAB prefix.
	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	let subscription_id = client::subscribe(&mut backend, SubscriptionKind::Address, &prefix, {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Ok(()));

	// Now renewal succeeds.
	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::renew(&mut backend, SubscriptionKind::Address, &prefix, {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Ok(()));

	// A block with a matching P2PKH output triggers the notification.
	let mut hash = [0u8; 20];
	hash[0] = 0xAB;
	let transaction = pay_to_hash_transaction(hash, 11_000);
	let (height, block) = node.push_block(vec![transaction.clone()]);

	drive(&mut backend, || !updates.lock().unwrap().is_empty()).await;

	let update = updates.lock().unwrap().remove(0);
	assert_eq!(update.command, commands::ADDRESS_UPDATE);
	assert_eq!(update.id, subscription_id);
	match client::parse_update(&update).unwrap() {
		client::Update::Address {
			version,
			address_hash,
			height: update_height,
			block_hash,
			transaction: update_transaction,
		} => {
			assert_eq!(version, crate::PAY_TO_PUBKEY_HASH_VERSION);
			assert_eq!(address_hash, hash);
			assert_eq!(update_height, height);
			assert_eq!(block_hash, block.header.block_hash());
			assert_eq!(update_transaction, transaction);
		},
		other => panic!("expected an address update, got {other:?}"),
	}

	// A pool accept for the same prefix notifies with height zero.
	node.organize(pay_to_hash_transaction(hash, 3_000), false).await.unwrap();
	drive(&mut backend, || !updates.lock().unwrap().is_empty()).await;
	let update = updates.lock().unwrap().remove(0);
	match client::parse_update(&update).unwrap() {
		client::Update::Address { height, block_hash, .. } => {
			assert_eq!(height, 0);
			assert_eq!(block_hash, bitcoin::BlockHash::all_zeros());
		},
		other => panic!("expected an address update, got {other:?}"),
	}

	// Unsubscribing silences and a second unsubscribe misses.
	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::unsubscribe(&mut backend, SubscriptionKind::Address, &prefix, {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Ok(()));
	assert_eq!(server.subscriptions().len(), 0);

	let code: Arc<Mutex<Option<Result<(), ErrorCode>>>> = Default::default();
	client::unsubscribe(&mut backend, SubscriptionKind::Address, &prefix, {
		let code = code.clone();
		move |result| *code.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || code.lock().unwrap().is_some()).await;
	assert_eq!(code.lock().unwrap().take().unwrap(), Err(ErrorCode::NotFound));

	server.stop().await;
}

#[tokio::test]
async fn heartbeat_counts_up_by_one_per_pulse() {
	init_test_logger();
	let context = zmq::Context::new();
	let authenticator =
		Arc::new(Authenticator::new(&settings::Server::default()).unwrap());

	let endpoint = format!("tcp://127.0.0.1:{PORTS_HEARTBEAT}");
	let mut service = HeartbeatService::new(
		context.clone(),
		authenticator,
		endpoint.clone(),
		Duration::from_millis(80),
	);
	service.start().unwrap();

	let frames = tokio::task::spawn_blocking(move || {
		let subscriber = context.socket(zmq::SUB).unwrap();
		subscriber.set_subscribe(b"").unwrap();
		subscriber.set_rcvtimeo(3_000).unwrap();
		subscriber.connect(&endpoint).unwrap();

		(0..3)
			.map(|_| subscriber.recv_bytes(0).unwrap())
			.collect::<Vec<_>>()
	})
	.await
	.unwrap();

	let counters: Vec<u32> = frames
		.iter()
		.map(|frame| u32::from_le_bytes(frame.as_slice().try_into().unwrap()))
		.collect();
	assert_eq!(counters[1], counters[0].wrapping_add(1));
	assert_eq!(counters[2], counters[0].wrapping_add(2));

	service.stop().await;
}

/// A manager whose notifications go nowhere, for publisher tests.
fn idle_subscriptions(context: &zmq::Context) -> Arc<SubscriptionManager> {
	Arc::new(SubscriptionManager::new(
		100,
		Duration::from_secs(600),
		QuerySender::new(context.clone(), "inproc://unused-notifications".to_string()),
		None,
	))
}

#[tokio::test]
async fn blocks_publish_in_reorganization_order() {
	init_test_logger();
	let context = zmq::Context::new();
	let authenticator =
		Arc::new(Authenticator::new(&settings::Server::default()).unwrap());
	let node = Arc::new(MemoryNode::new());

	let endpoint = format!("tcp://127.0.0.1:{PORTS_BLOCKS}");
	let mut service = BlockService::new(
		context.clone(),
		authenticator,
		endpoint.clone(),
		node.clone(),
		idle_subscriptions(&context),
	);
	service.start().unwrap();

	let subscriber = tokio::task::spawn_blocking({
		let context = context.clone();
		move || {
			let subscriber = context.socket(zmq::SUB).unwrap();
			subscriber.set_subscribe(b"").unwrap();
			subscriber.set_rcvtimeo(3_000).unwrap();
			subscriber.connect(&endpoint).unwrap();
			subscriber
		}
	})
	.await
	.unwrap();

	// Slow joiner: give the subscription time to reach the publisher.
	tokio::time::sleep(Duration::from_millis(200)).await;

	let transaction = pay_to_hash_transaction([1; 20], 5_000);
	let (fork_height, blocks) = node.push_blocks(vec![vec![transaction.clone()], vec![]]);

	let frames = tokio::task::spawn_blocking(move || {
		(0..2).map(|_| subscriber.recv_bytes(0).unwrap()).collect::<Vec<_>>()
	})
	.await
	.unwrap();

	// [ height:4 ] [ header:80 ] [ txid:32 ]...
	assert_eq!(frames[0].len(), 84 + 32);
	assert_eq!(&frames[0][..4], &(fork_height + 1).to_le_bytes()[..]);
	assert_eq!(&frames[0][4..84], &consensus::serialize(&blocks[0].header)[..]);
	assert_eq!(&frames[0][84..116], &transaction.compute_txid().to_byte_array()[..]);

	assert_eq!(frames[1].len(), 84);
	assert_eq!(&frames[1][..4], &(fork_height + 2).to_le_bytes()[..]);
	assert_eq!(&frames[1][4..84], &consensus::serialize(&blocks[1].header)[..]);

	service.stop().await;
}

#[tokio::test]
async fn accepted_transactions_publish_their_canonical_bytes() {
	init_test_logger();
	let context = zmq::Context::new();
	let authenticator =
		Arc::new(Authenticator::new(&settings::Server::default()).unwrap());
	let node = Arc::new(MemoryNode::new());

	let endpoint = format!("tcp://127.0.0.1:{PORTS_TRANSACTIONS}");
	let mut service = TransactionService::new(
		context.clone(),
		authenticator,
		endpoint.clone(),
		node.clone(),
		idle_subscriptions(&context),
	);
	service.start().unwrap();

	let subscriber = tokio::task::spawn_blocking({
		let context = context.clone();
		move || {
			let subscriber = context.socket(zmq::SUB).unwrap();
			subscriber.set_subscribe(b"").unwrap();
			subscriber.set_rcvtimeo(3_000).unwrap();
			subscriber.connect(&endpoint).unwrap();
			subscriber
		}
	})
	.await
	.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let transaction = pay_to_hash_transaction([2; 20], 600);
	node.organize(transaction.clone(), false).await.unwrap();

	let frame = tokio::task::spawn_blocking(move || subscriber.recv_bytes(0).unwrap())
		.await
		.unwrap();
	assert_eq!(frame, consensus::serialize(&transaction));

	service.stop().await;
}

#[tokio::test]
async fn the_query_service_restarts_cleanly() {
	let node = Arc::new(MemoryNode::with_chain_height(7));
	let (mut server, mut backend) = start_server(PORTS_RESTART, node.clone()).await;

	let response: Arc<Mutex<Option<Result<u32, ErrorCode>>>> = Default::default();
	client::fetch_last_height(&mut backend, {
		let response = response.clone();
		move |result| *response.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || response.lock().unwrap().is_some()).await;
	assert_eq!(response.lock().unwrap().take().unwrap().unwrap(), 7);

	// Stop and start again on the same endpoints; stop twice to prove
	// idempotence.
	server.stop().await;
	server.stop().await;
	server.start().unwrap();

	let context = zmq::Context::new();
	let mut backend = Backend::connect_with_options(
		&context,
		&format!("tcp://127.0.0.1:{PORTS_RESTART}"),
		fast_options(),
	)
	.unwrap();

	let response: Arc<Mutex<Option<Result<u32, ErrorCode>>>> = Default::default();
	client::fetch_last_height(&mut backend, {
		let response = response.clone();
		move |result| *response.lock().unwrap() = Some(result)
	})
	.unwrap();
	drive(&mut backend, || response.lock().unwrap().is_some()).await;
	assert_eq!(response.lock().unwrap().take().unwrap().unwrap(), 7);

	server.stop().await;
}

#[tokio::test]
async fn a_panicking_handler_does_not_kill_the_worker() {
	init_test_logger();
	let context = zmq::Context::new();
	let authenticator =
		Arc::new(Authenticator::new(&settings::Server::default()).unwrap());

	let endpoint = format!("tcp://127.0.0.1:{PORTS_PANICS}");
	let mut service =
		QueryService::new(context.clone(), authenticator, endpoint.clone(), false);
	service.start().unwrap();

	let mut workers = QueryWorker::new(context.clone(), false);
	workers.attach("test.panic", |_request, _sender| panic!("handler bug"));
	workers.attach("test.echo", |request, sender| {
		let body = request.data.clone();
		sender.send(Message::result(&request, &body));
	});
	// A single worker, so both requests hit the same thread.
	workers.start(1).unwrap();

	let client_context = zmq::Context::new();
	let mut backend = Backend::connect_with_options(
		&client_context,
		&format!("tcp://127.0.0.1:{PORTS_PANICS}"),
		fast_options(),
	)
	.unwrap();

	let echoed: Arc<AtomicUsize> = Default::default();
	backend.request("test.panic", vec![], |_| {}).unwrap();
	backend
		.request("test.echo", vec![0xEE], {
			let echoed = echoed.clone();
			move |data| {
				assert_eq!(data, vec![0, 0, 0, 0, 0xEE]);
				echoed.fetch_add(1, Ordering::Relaxed);
			}
		})
		.unwrap();

	drive(&mut backend, || echoed.load(Ordering::Relaxed) == 1).await;

	workers.stop();
	service.stop();
}

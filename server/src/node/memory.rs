//! An in-memory full node: a linear chain, a transaction pool and the two
//! event subscriptions. Backs the default binary and the test suites.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;
use bitcoin::{
	block::{Header, Version},
	hashes::Hash,
	Block, BlockHash, CompactTarget, OutPoint, Transaction, TxMerkleNode, Txid,
};
use gateway_protocol::{ErrorCode, HistoryRow, Prefix, StealthRow};
use tokio::sync::broadcast;

use super::{FullNode, NodeResult, Reorganization};
use crate::scripts;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryNode {
	state: Mutex<State>,
	reorganization_sender: broadcast::Sender<Reorganization>,
	transaction_sender: broadcast::Sender<Transaction>,
	connections: AtomicU32,
}

#[derive(Default)]
struct State {
	/// The chain, indexed by height.
	blocks: Vec<Block>,
	block_index: HashMap<BlockHash, u32>,
	transaction_index: HashMap<Txid, (u32, u32)>,
	pool: HashMap<Txid, Transaction>,
	history: HashMap<[u8; 20], Vec<HistoryRow>>,
	/// Which address hash owns a confirmed output, for spend marking.
	output_owners: HashMap<OutPoint, [u8; 20]>,
	stealth: Vec<(u32, [u8; 4], StealthRow)>,
}

impl Default for MemoryNode {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryNode {
	pub fn new() -> Self {
		let (reorganization_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let (transaction_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

		let mut state = State::default();
		append_block(&mut state, vec![]);

		MemoryNode {
			state: Mutex::new(state),
			reorganization_sender,
			transaction_sender,
			connections: AtomicU32::new(0),
		}
	}

	/// A node whose chain is already `height` blocks past genesis. No
	/// events fire for the seeded blocks.
	pub fn with_chain_height(height: u32) -> Self {
		let node = Self::new();
		{
			let mut state = node.state.lock().expect("unpoisoned");
			for _ in 0..height {
				append_block(&mut state, vec![]);
			}
		}
		node
	}

	/// Append one block holding `txdata` and fire a single reorganization
	/// event for it.
	pub fn push_block(&self, txdata: Vec<Transaction>) -> (u32, Block) {
		let (fork_height, mut blocks) = self.push_blocks(vec![txdata]);
		(fork_height + 1, blocks.remove(0))
	}

	/// Append several blocks and fire one reorganization event covering
	/// all of them, in order.
	pub fn push_blocks(&self, txdata: Vec<Vec<Transaction>>) -> (u32, Vec<Block>) {
		let (fork_height, blocks) = {
			let mut state = self.state.lock().expect("unpoisoned");
			let fork_height = (state.blocks.len() - 1) as u32;
			let blocks: Vec<Block> =
				txdata.into_iter().map(|transactions| append_block(&mut state, transactions)).collect();
			(fork_height, blocks)
		};

		// No receivers is fine; publication services may not be running.
		let _ = self.reorganization_sender.send(Reorganization {
			fork_height,
			new_blocks: Arc::new(blocks.clone()),
			old_blocks: Arc::new(vec![]),
		});

		(fork_height, blocks)
	}

	pub fn set_connection_count(&self, count: u32) {
		self.connections.store(count, Ordering::Relaxed);
	}

	pub fn pool_size(&self) -> usize {
		self.state.lock().expect("unpoisoned").pool.len()
	}
}

#[async_trait]
impl FullNode for MemoryNode {
	async fn fetch_history(
		&self,
		address_hash: [u8; 20],
		from_height: u32,
	) -> NodeResult<Vec<HistoryRow>> {
		let state = self.state.lock().expect("unpoisoned");
		Ok(state
			.history
			.get(&address_hash)
			.map(|rows| {
				rows.iter().filter(|row| row.output_height >= from_height).cloned().collect()
			})
			.unwrap_or_default())
	}

	async fn fetch_transaction(&self, hash: Txid) -> NodeResult<Transaction> {
		let state = self.state.lock().expect("unpoisoned");
		if let Some(transaction) = state.pool.get(&hash) {
			return Ok(transaction.clone())
		}
		let (height, position) = state.transaction_index.get(&hash).ok_or(ErrorCode::NotFound)?;
		Ok(state.blocks[*height as usize].txdata[*position as usize].clone())
	}

	async fn fetch_last_height(&self) -> NodeResult<u32> {
		let state = self.state.lock().expect("unpoisoned");
		Ok((state.blocks.len() - 1) as u32)
	}

	async fn block_header_by_height(&self, height: u32) -> NodeResult<Header> {
		let state = self.state.lock().expect("unpoisoned");
		state.blocks.get(height as usize).map(|block| block.header).ok_or(ErrorCode::NotFound)
	}

	async fn block_header_by_hash(&self, hash: BlockHash) -> NodeResult<Header> {
		let state = self.state.lock().expect("unpoisoned");
		let height = state.block_index.get(&hash).ok_or(ErrorCode::NotFound)?;
		Ok(state.blocks[*height as usize].header)
	}

	async fn transaction_index(&self, hash: Txid) -> NodeResult<(u32, u32)> {
		let state = self.state.lock().expect("unpoisoned");
		state.transaction_index.get(&hash).copied().ok_or(ErrorCode::NotFound)
	}

	async fn fetch_stealth(
		&self,
		prefix: Prefix,
		from_height: u32,
	) -> NodeResult<Vec<StealthRow>> {
		let state = self.state.lock().expect("unpoisoned");
		Ok(state
			.stealth
			.iter()
			.filter(|(height, row_prefix, _)| {
				*height >= from_height && prefix.matches(row_prefix)
			})
			.map(|(_, _, row)| row.clone())
			.collect())
	}

	async fn organize(&self, transaction: Transaction, simulate: bool) -> NodeResult<()> {
		if transaction.output.is_empty() {
			return Err(ErrorCode::InvalidArgument)
		}
		if simulate {
			return Ok(())
		}
		self.state
			.lock()
			.expect("unpoisoned")
			.pool
			.insert(transaction.compute_txid(), transaction.clone());
		let _ = self.transaction_sender.send(transaction);
		Ok(())
	}

	async fn broadcast(&self, _transaction: Transaction) -> NodeResult<()> {
		// Relay to peers happens outside this model; always succeeds.
		Ok(())
	}

	fn connection_count(&self) -> u32 {
		self.connections.load(Ordering::Relaxed)
	}

	fn subscribe_reorganizations(&self) -> broadcast::Receiver<Reorganization> {
		self.reorganization_sender.subscribe()
	}

	fn subscribe_transactions(&self) -> broadcast::Receiver<Transaction> {
		self.transaction_sender.subscribe()
	}
}

/// Append the next block, maintaining every index. Returns the block.
fn append_block(state: &mut State, txdata: Vec<Transaction>) -> Block {
	let height = state.blocks.len() as u32;
	let prev_blockhash = state
		.blocks
		.last()
		.map(|block| block.header.block_hash())
		.unwrap_or_else(BlockHash::all_zeros);

	let block = Block {
		header: Header {
			version: Version::ONE,
			prev_blockhash,
			merkle_root: TxMerkleNode::all_zeros(),
			time: 1_231_006_505 + height,
			bits: CompactTarget::from_consensus(0x1d00_ffff),
			nonce: height,
		},
		txdata,
	};

	state.block_index.insert(block.header.block_hash(), height);

	for (position, transaction) in block.txdata.iter().enumerate() {
		let txid = transaction.compute_txid();
		state.transaction_index.insert(txid, (height, position as u32));
		state.pool.remove(&txid);

		for (vout, output) in transaction.output.iter().enumerate() {
			if let Some((_, hash)) = scripts::payment_address_hash(&output.script_pubkey) {
				let point = OutPoint { txid, vout: vout as u32 };
				state.output_owners.insert(point, hash);
				state.history.entry(hash).or_default().push(HistoryRow {
					output: point,
					output_height: height,
					value: output.value.to_sat(),
					spend: OutPoint::null(),
					spend_height: u32::MAX,
				});
			}
		}

		for (input_index, input) in transaction.input.iter().enumerate() {
			if let Some(owner) = state.output_owners.get(&input.previous_output).copied() {
				if let Some(row) = state
					.history
					.get_mut(&owner)
					.and_then(|rows| {
						rows.iter_mut().find(|row| row.output == input.previous_output)
					}) {
					row.spend = OutPoint { txid, vout: input_index as u32 };
					row.spend_height = height;
				}
			}
		}

		let outputs = &transaction.output;
		for (index, output) in outputs.iter().enumerate() {
			let Some(prefix) = scripts::stealth_prefix(&output.script_pubkey) else { continue };
			let Some(ephemeral_key) = scripts::stealth_ephemeral_key(&output.script_pubkey)
			else {
				continue
			};
			let Some((_, address_hash)) = outputs
				.get(index + 1)
				.and_then(|paired| scripts::payment_address_hash(&paired.script_pubkey))
			else {
				continue
			};
			state.stealth.push((
				height,
				prefix,
				StealthRow { ephemeral_key, address_hash, transaction_hash: txid },
			));
		}
	}

	state.blocks.push(block.clone());
	block
}


#[cfg(test)]
mod tests {
	use gateway_protocol::Prefix;

	use super::{test_utils::*, *};

	#[tokio::test]
	async fn seeded_chain_reports_its_height() {
		let node = MemoryNode::with_chain_height(1500);
		assert_eq!(node.fetch_last_height().await.unwrap(), 1500);
	}

	#[tokio::test]
	async fn headers_resolve_by_height_and_hash() {
		let node = MemoryNode::new();
		let (height, block) = node.push_block(vec![]);

		assert_eq!(node.block_header_by_height(height).await.unwrap(), block.header);
		assert_eq!(
			node.block_header_by_hash(block.header.block_hash()).await.unwrap(),
			block.header
		);
		assert_eq!(
			node.block_header_by_height(height + 1).await.unwrap_err(),
			ErrorCode::NotFound
		);
	}

	#[tokio::test]
	async fn history_tracks_outputs_and_spends() {
		let node = MemoryNode::new();
		let hash = [0x11; 20];

		let funding = pay_to_hash_transaction(hash, 50_000);
		let funding_txid = funding.compute_txid();
		let (height, _) = node.push_block(vec![funding]);

		let rows = node.fetch_history(hash, 0).await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].output_height, height);
		assert_eq!(rows[0].value, 50_000);
		assert_eq!(rows[0].spend_height, u32::MAX);

		// Spend it in the next block.
		let spend = spend_transaction(
			OutPoint { txid: funding_txid, vout: 0 },
			[0x22; 20],
			49_000,
		);
		let (spend_height, _) = node.push_block(vec![spend]);

		let rows = node.fetch_history(hash, 0).await.unwrap();
		assert_eq!(rows[0].spend_height, spend_height);

		// from_height filters out the funding row.
		assert!(node.fetch_history(hash, spend_height).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn organize_admits_to_the_pool_and_fires_the_event() {
		let node = MemoryNode::new();
		let mut events = node.subscribe_transactions();

		let transaction = pay_to_hash_transaction([9; 20], 1_000);
		node.organize(transaction.clone(), false).await.unwrap();

		assert_eq!(node.pool_size(), 1);
		assert_eq!(events.recv().await.unwrap(), transaction);
		assert_eq!(
			node.fetch_transaction(transaction.compute_txid()).await.unwrap(),
			transaction
		);

		// Simulation does not retain.
		node.organize(pay_to_hash_transaction([9; 20], 2_000), true).await.unwrap();
		assert_eq!(node.pool_size(), 1);
	}

	#[tokio::test]
	async fn confirmation_clears_the_pool_and_indexes_the_transaction() {
		let node = MemoryNode::new();
		let transaction = pay_to_hash_transaction([5; 20], 123);
		node.organize(transaction.clone(), false).await.unwrap();

		let (height, _) = node.push_block(vec![transaction.clone()]);
		assert_eq!(node.pool_size(), 0);
		assert_eq!(
			node.transaction_index(transaction.compute_txid()).await.unwrap(),
			(height, 0)
		);
	}

	#[tokio::test]
	async fn stealth_rows_filter_by_prefix_and_height() {
		let node = MemoryNode::new();
		let transaction = stealth_transaction([3; 32], [8; 20], 700);
		let prefix = crate::scripts::transaction_stealth_prefix(&transaction).unwrap();
		let (height, _) = node.push_block(vec![transaction]);

		let rows = node
			.fetch_stealth(Prefix::new(32, prefix.to_vec()).unwrap(), 0)
			.await
			.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].ephemeral_key, [3; 32]);
		assert_eq!(rows[0].address_hash, [8; 20]);

		// A later from_height excludes the row, as does a different prefix.
		assert!(node
			.fetch_stealth(Prefix::new(32, prefix.to_vec()).unwrap(), height + 1)
			.await
			.unwrap()
			.is_empty());
		let mut other = prefix;
		other[0] ^= 0xFF;
		assert!(node
			.fetch_stealth(Prefix::new(32, other.to_vec()).unwrap(), 0)
			.await
			.unwrap()
			.is_empty());
	}

	#[tokio::test]
	async fn push_blocks_fires_one_ordered_reorganization() {
		let node = MemoryNode::new();
		let mut events = node.subscribe_reorganizations();

		let (fork_height, blocks) = node.push_blocks(vec![vec![], vec![], vec![]]);

		let event = events.recv().await.unwrap();
		assert_eq!(event.fork_height, fork_height);
		assert_eq!(event.new_blocks.len(), 3);
		for (ours, published) in blocks.iter().zip(event.new_blocks.iter()) {
			assert_eq!(ours.header, published.header);
		}
	}
}

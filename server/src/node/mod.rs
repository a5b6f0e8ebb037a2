//! The embedded full node, modeled as a collaborator exposing chain
//! queries, transaction pool organization and two event subscriptions.
//! Queries are async and resolve on node owned tasks; handlers must not
//! assume they complete on the calling thread.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{block::Header, Block, BlockHash, Transaction, Txid};
use gateway_protocol::{ErrorCode, HistoryRow, Prefix, StealthRow};
use tokio::sync::broadcast;

pub type NodeResult<T> = Result<T, ErrorCode>;

/// A chain reorganization: the new best blocks in order, the displaced
/// tail, and the height of the common ancestor. The first new block sits
/// at `fork_height + 1`.
#[derive(Debug, Clone)]
pub struct Reorganization {
	pub fork_height: u32,
	pub new_blocks: Arc<Vec<Block>>,
	pub old_blocks: Arc<Vec<Block>>,
}

#[async_trait]
pub trait FullNode: Send + Sync + 'static {
	/// Confirmed history rows for a payment address hash, oldest first.
	async fn fetch_history(
		&self,
		address_hash: [u8; 20],
		from_height: u32,
	) -> NodeResult<Vec<HistoryRow>>;

	/// A transaction by hash, from the pool or the chain.
	async fn fetch_transaction(&self, hash: Txid) -> NodeResult<Transaction>;

	async fn fetch_last_height(&self) -> NodeResult<u32>;

	async fn block_header_by_height(&self, height: u32) -> NodeResult<Header>;

	async fn block_header_by_hash(&self, hash: BlockHash) -> NodeResult<Header>;

	/// Confirmation height and block position of a transaction.
	async fn transaction_index(&self, hash: Txid) -> NodeResult<(u32, u32)>;

	async fn fetch_stealth(
		&self,
		prefix: Prefix,
		from_height: u32,
	) -> NodeResult<Vec<StealthRow>>;

	/// Admit a transaction to the memory pool. With `simulate` the
	/// transaction is validated but not retained and no event fires.
	async fn organize(&self, transaction: Transaction, simulate: bool) -> NodeResult<()>;

	/// Relay a transaction to peers without touching the local pool.
	async fn broadcast(&self, transaction: Transaction) -> NodeResult<()>;

	fn connection_count(&self) -> u32;

	fn subscribe_reorganizations(&self) -> broadcast::Receiver<Reorganization>;

	fn subscribe_transactions(&self) -> broadcast::Receiver<Transaction>;
}

//! Command names are bit-exact: clients match on the echoed string.

pub const FETCH_HISTORY: &str = "blockchain.fetch_history";
pub const FETCH_HISTORY2: &str = "blockchain.fetch_history2";
pub const FETCH_TRANSACTION: &str = "blockchain.fetch_transaction";
pub const FETCH_LAST_HEIGHT: &str = "blockchain.fetch_last_height";
pub const FETCH_BLOCK_HEADER: &str = "blockchain.fetch_block_header";
pub const FETCH_TRANSACTION_INDEX: &str = "blockchain.fetch_transaction_index";
pub const FETCH_STEALTH: &str = "blockchain.fetch_stealth";

pub const POOL_BROADCAST: &str = "transaction_pool.broadcast";
pub const POOL_VALIDATE2: &str = "transaction_pool.validate2";
pub const POOL_FETCH_TRANSACTION: &str = "transaction_pool.fetch_transaction";

pub const BROADCAST_TRANSACTION: &str = "protocol.broadcast_transaction";
pub const TOTAL_CONNECTIONS: &str = "protocol.total_connections";

pub const SUBSCRIBE: &str = "address.subscribe";
pub const RENEW: &str = "address.renew";
pub const UNSUBSCRIBE: &str = "address.unsubscribe";

/// Notification commands (server initiated, never dispatched).
pub const ADDRESS_UPDATE: &str = "address.update";
pub const STEALTH_UPDATE: &str = "address.stealth_update";

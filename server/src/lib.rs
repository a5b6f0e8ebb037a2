pub mod auth;
pub mod interface;
pub mod logging;
pub mod node;
pub mod scripts;
pub mod server;
pub mod services;
pub mod settings;
pub mod subscriptions;
pub mod workers;

/// Payment address version bytes carried in address notifications and
/// history requests.
pub const PAY_TO_PUBKEY_HASH_VERSION: u8 = 0x00;
pub const PAY_TO_SCRIPT_HASH_VERSION: u8 = 0x05;

//! DEALER-side access to a gateway server: response correlation, retry
//! with exponential backoff, and typed wrappers for every published
//! command.

pub mod backend;
pub mod interface;

pub use backend::{Backend, RetryOptions};

//! Backend integration
//!
//! - [`transaction`]: transaction lookup over the backend HTTP API
//! - [`channel`]: event and command lists (Redis or in memory)
//! - [`publisher`]: event encoding and publishing

pub mod channel;
pub mod publisher;
pub mod transaction;

pub use channel::{ChannelError, CommandSource, EventChannel, MemoryChannel, RedisChannel};
pub use publisher::EventPublisher;
pub use transaction::{HttpTransactionClient, TransactionError, TransactionLookup, TransactionRecord};

//! Command Processor: SET/GET/DELETE/INCR/DECR/APPEND/PREPEND
//! and their bulk counterparts MGET/MSET, with an idempotency cache keyed
//! by command id.

mod idempotency;
mod processor;

pub use idempotency::IdempotencyCache;
pub use processor::CommandProcessor;

use std::time::Duration;

pub const SINGLE_KEY_TIMEOUT: Duration = Duration::from_secs(10);
pub const BULK_TIMEOUT: Duration = Duration::from_secs(20);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

//! Redis-backed broker and cache adapters.
//!
//! One connection pool serves three concerns: the priority-routed intake
//! bus, the per-bitrate work queues, and the streaming byte cache.

pub mod cache;
pub mod intake;
pub mod pool;
pub mod work_queue;

pub use cache::RedisStreamCache;
pub use intake::{RedisDeletionQueue, RedisIntakeQueue};
pub use pool::RedisPool;
pub use work_queue::{RedisWorkQueue, WorkQueuePolicy};

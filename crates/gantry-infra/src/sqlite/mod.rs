//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod checkpoint;
pub mod pool;
pub mod rate_limit;

pub use checkpoint::SqliteCheckpointRepository;
pub use pool::DatabasePool;
pub use rate_limit::SqliteRateLimitStore;

//! Response caching and retrying request execution.
//!
//! This module provides:
//! - A durable, age-bounded cache of the latest response per resource key
//! - A request executor with exponential backoff that falls back to that
//!   cache once retries are exhausted

mod layer;
mod storage;
mod traits;

pub use layer::{RequestExecutor, RetryPolicy};
pub use storage::CacheStore;
pub use traits::QueryKey;

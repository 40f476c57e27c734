//! Local cache
//!
//! Mirrors remote collections into SQLite so they are available offline and
//! observable by the rest of the engine.
//!
//! - `schema`: table definitions and version tracking
//! - `store`: [`LocalCache`] and its watch-based observers
//! - `error`: [`CacheError`]

pub mod error;
pub mod schema;
mod store;

pub use error::{CacheError, CacheResult};
pub use store::{CacheRecord, CacheStats, Collection, LocalCache, ReplaceSummary};

//! Rowcache query cache
//!
//! Cache-aside interception for a relational data-access client, with two
//! tiers per table:
//!
//! - **Primary tier (`p`)**: one entry per row, keyed by primary key
//! - **Search tier (`s`)**: one entry per query signature (query text plus
//!   bound parameters), holding the full result or a "not found" sentinel
//!
//! Concurrent identical reads are coalesced by a single-flight coordinator,
//! and writes invalidate the affected entries of both tiers.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `rowcache.toml`:
//!
//! ```toml
//! [cache]
//! level = "all"            # off | primary_only | search_only | all
//! tables = ["orders"]      # empty caches every table
//! ttl_millis = 60000
//! max_item_count = 1000
//! # ... see config.rs for all options
//! ```

mod config;
mod context;
mod error;
mod hooks;
mod interceptor;
mod invalidation;
mod keys;
mod lock;
mod outcome;
mod singleflight;
mod stats;
mod store;

pub use config::{CacheConfig, CacheLevel, DEFAULT_KEY_PREFIX, jitter};
pub use context::{CacheableRow, Lookup, ReadContext, ResultShape, WriteContext, WriteKind};
pub use error::{CacheError, StoreError};
pub use hooks::{QueryCache, ReadDecision};
pub use invalidation::{InvalidationPlan, PrimaryInvalidation};
pub use keys::{CacheKey, Namespace, Param, normalize_query, signature};
pub use outcome::CacheOutcome;
pub use singleflight::{Completion, Flight, FlightOwner, FlightWaiter, SingleFlight};
pub use stats::Stats;
pub use store::{KvStore, MemoryStore};

/// Names of every metric the cache emits.
pub mod metric_names {
    pub const HIT_TOTAL: &str = "rowcache_hit_total";
    pub const MISS_TOTAL: &str = "rowcache_miss_total";
    pub const INVALIDATION_TOTAL: &str = "rowcache_invalidation_total";
    pub const STORE_ERROR_TOTAL: &str = "rowcache_store_error_total";
    pub const SINGLEFLIGHT_WAITERS_TOTAL: &str = "rowcache_singleflight_waiters_total";
}

pub mod response_cache;

pub use response_cache::{
    CacheEntry, CacheOptions, CacheStats, ResponseCache, DEFAULT_EVICTION_BATCH,
    DEFAULT_MAX_ENTRIES, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
};

//! Deterministic generation cache
//!
//! External generation calls are keyed by `(model, prompt)`, stored on first
//! use and only trusted unattended after a human has verified them.

pub mod cache;
pub mod cached;
pub mod client;
pub mod rate_limit;

pub use cache::{
    prompt_hash, CacheEntry, CacheStats, CacheStore, MemoryCacheStore, SqliteCacheStore, UnavailableStore,
};
pub use cached::{CacheOutcome, CacheStatus, CachedGenerator, LookupContext};
pub use client::{client_for, GenerationClient, OllamaClient, OpenAiClient};
pub use rate_limit::{limiter_for, NoOpLimiter, RateLimiter, TokenBucket};

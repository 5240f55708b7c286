//! Cache-gated generation.
//!
//! | stored entry | verified_only | result |
//! |---|---|---|
//! | none | any | generate, store unverified, MISS |
//! | unverified | false | HIT with the unverified text |
//! | unverified | true | MISS; fresh text is generated, the entry is kept |
//! | verified | any | HIT with corrected-or-original text, never generates |
//!
//! Every hit on an existing entry bumps `hit_count`, including the
//! unverified-treated-as-miss case.

use super::cache::{prompt_hash, CacheEntry, CacheStats, CacheStore};
use super::client::GenerationClient;
use super::rate_limit::RateLimiter;
use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheOutcome {
    pub text: String,
    pub status: CacheStatus,
    pub verified: bool,
    pub prompt_hash: String,
    /// False when the store was down and the text came straight from the
    /// generation service
    pub cached: bool,
}

/// Optional context stored alongside a new entry
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    pub device_id: Option<String>,
    pub message_type: Option<String>,
}

pub struct CachedGenerator {
    store: Arc<dyn CacheStore>,
    client: Arc<dyn GenerationClient>,
    limiter: Box<dyn RateLimiter>,
    allow_uncached_fallback: bool,
}

impl CachedGenerator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        client: Arc<dyn GenerationClient>,
        limiter: Box<dyn RateLimiter>,
    ) -> Self {
        Self {
            store,
            client,
            limiter,
            allow_uncached_fallback: false,
        }
    }

    /// Let best-effort lookups generate directly when the store is down
    pub fn with_uncached_fallback(mut self, allow: bool) -> Self {
        self.allow_uncached_fallback = allow;
        self
    }

    pub fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    pub fn lookup(&self, model: &str, prompt: &str, verified_only: bool) -> Result<CacheOutcome, CacheError> {
        self.lookup_with_context(model, prompt, verified_only, &LookupContext::default())
    }

    pub fn lookup_with_context(
        &self,
        model: &str,
        prompt: &str,
        verified_only: bool,
        context: &LookupContext,
    ) -> Result<CacheOutcome, CacheError> {
        let hash = prompt_hash(model, prompt);

        let existing = match self.store.get(&hash) {
            Ok(existing) => existing,
            Err(e) => return self.uncached(e, model, prompt, hash, verified_only),
        };

        let Some(entry) = existing else {
            debug!(hash = %short(&hash), model, "Cache miss");
            let text = self.generate(model, prompt)?;
            let entry = CacheEntry::unverified(model, prompt, text.clone())
                .with_context(context.device_id.clone(), context.message_type.clone());
            match self.store.insert_if_absent(&entry) {
                Ok(true) => {}
                Ok(false) => debug!(hash = %short(&hash), "Entry inserted concurrently, keeping the first"),
                Err(e) => {
                    if verified_only || !self.allow_uncached_fallback {
                        return Err(e);
                    }
                    warn!(error = %e, "Could not store generated response");
                    return Ok(CacheOutcome {
                        text,
                        status: CacheStatus::Miss,
                        verified: false,
                        prompt_hash: hash,
                        cached: false,
                    });
                }
            }
            return Ok(CacheOutcome {
                text,
                status: CacheStatus::Miss,
                verified: false,
                prompt_hash: hash,
                cached: true,
            });
        };

        if let Err(e) = self.store.record_hit(&hash) {
            return self.uncached(e, model, prompt, hash, verified_only);
        }

        if entry.is_verified {
            debug!(hash = %short(&hash), "Cache hit (verified)");
            return Ok(CacheOutcome {
                text: entry.response().to_string(),
                status: CacheStatus::Hit,
                verified: true,
                prompt_hash: hash,
                cached: true,
            });
        }

        if verified_only {
            debug!(hash = %short(&hash), "Unverified entry refused for verified-only lookup");
            let text = self.generate(model, prompt)?;
            return Ok(CacheOutcome {
                text,
                status: CacheStatus::Miss,
                verified: false,
                prompt_hash: hash,
                cached: true,
            });
        }

        debug!(hash = %short(&hash), "Cache hit (unverified)");
        Ok(CacheOutcome {
            text: entry.original_response,
            status: CacheStatus::Hit,
            verified: false,
            prompt_hash: hash,
            cached: true,
        })
    }

    /// Human review: the single false → true transition for an entry
    pub fn verify(&self, hash: &str, corrected: Option<&str>) -> Result<CacheEntry, CacheError> {
        let entry = self.store.mark_verified(hash, corrected)?;
        debug!(hash = %short(hash), corrected = corrected.is_some(), "Cache entry verified");
        Ok(entry)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        self.store.stats()
    }

    pub fn pending_review(&self, limit: usize) -> Result<Vec<CacheEntry>, CacheError> {
        self.store.pending_review(limit)
    }

    fn generate(&self, model: &str, prompt: &str) -> Result<String, CacheError> {
        self.limiter.acquire()?;
        self.client.generate(model, prompt)
    }

    /// The store failed. Verified-only callers must not proceed.
    fn uncached(
        &self,
        error: CacheError,
        model: &str,
        prompt: &str,
        hash: String,
        verified_only: bool,
    ) -> Result<CacheOutcome, CacheError> {
        if verified_only || !self.allow_uncached_fallback {
            return Err(error);
        }
        warn!(error = %error, "Cache store unavailable, generating without cache");
        let text = self.generate(model, prompt)?;
        Ok(CacheOutcome {
            text,
            status: CacheStatus::Miss,
            verified: false,
            prompt_hash: hash,
            cached: false,
        })
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

use crate::config::{GenerationConfig, RateLimitConfig};
use crate::error::CacheError;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Gate in front of every external generation call
pub trait RateLimiter: Send + Sync {
    /// Block until a call may proceed, or fail with `CacheError::RateLimited`
    fn acquire(&self) -> Result<(), CacheError>;
}

/// For local or offline generation services
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLimiter;

impl RateLimiter for NoOpLimiter {
    fn acquire(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Classic token bucket: `capacity` tokens, refilled continuously at
/// `refill_per_sec`. Callers wait for a token up to `timeout`.
///
/// Only remote providers sit behind a bucket; see [`limiter_for`].
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    timeout: Duration,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, timeout: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        // NaN, infinite and negative rates all mean "never refills"
        let refill_per_sec = if refill_per_sec.is_finite() && refill_per_sec > 0.0 {
            refill_per_sec
        } else {
            0.0
        };
        Self {
            capacity,
            refill_per_sec,
            timeout,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Limiter described by `config`; a disabled limiter is a no-op
    pub fn from_config(config: &RateLimitConfig) -> Box<dyn RateLimiter> {
        if config.enabled {
            Box::new(Self::new(
                config.capacity,
                config.refill_per_sec,
                Duration::from_secs(config.acquire_timeout_secs),
            ))
        } else {
            Box::new(NoOpLimiter)
        }
    }

    /// Take a token now, or report how long until one is available
    /// (`None` when the bucket never refills).
    pub fn try_acquire(&self) -> Result<(), Option<Duration>> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_sec <= 0.0 {
            return Err(None);
        }
        let missing = 1.0 - bucket.tokens;
        Err(Duration::try_from_secs_f64(missing / self.refill_per_sec).ok())
    }

    pub fn available(&self) -> f64 {
        let bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = bucket.refilled_at.elapsed().as_secs_f64();
        (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}

/// Limiter for the configured provider. Local generation is never throttled.
pub fn limiter_for(config: &GenerationConfig) -> Box<dyn RateLimiter> {
    if config.provider.is_remote() {
        TokenBucket::from_config(&config.rate_limit)
    } else {
        Box::new(NoOpLimiter)
    }
}

impl RateLimiter for TokenBucket {
    fn acquire(&self) -> Result<(), CacheError> {
        let started = Instant::now();
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let waited = started.elapsed();
            match wait {
                Some(wait) if waited + wait <= self.timeout => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for a token");
                    thread::sleep(wait);
                }
                _ => return Err(CacheError::RateLimited { waited }),
            }
        }
    }
}

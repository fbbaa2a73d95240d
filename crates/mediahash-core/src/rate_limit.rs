//! Rate limiting for the enrichment stage.
//!
//! Every hash invocation acquires one permit before touching the artifact
//! host. Acquisition blocks the calling task until a permit is granted;
//! callers are never dropped. [`TokenBucket`] limits within one process
//! (clones share the bucket); the store-backed limiter in `mediahash-db`
//! enforces the same contract across all worker processes.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

/// A fixed number of permits per unit of time, e.g. `5/s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub permits: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn new(permits: u32, per: Duration) -> Result<Self, AppError> {
        if permits == 0 || per.is_zero() {
            return Err(AppError::ConfigError(
                "rate limit must allow at least one permit per non-zero interval".into(),
            ));
        }
        Ok(Self { permits, per })
    }

    pub fn per_second(permits: u32) -> Result<Self, AppError> {
        Self::new(permits, Duration::from_secs(1))
    }

    /// Permits regained per second.
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.permits) / self.per.as_secs_f64()
    }

    /// Time for one permit to refill.
    pub fn interval(&self) -> Duration {
        self.per / self.permits
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            permits: 5,
            per: Duration::from_secs(1),
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.per == Duration::from_secs(1) {
            write!(f, "{}/s", self.permits)
        } else if self.per == Duration::from_secs(60) {
            write!(f, "{}/m", self.permits)
        } else if self.per == Duration::from_secs(3600) {
            write!(f, "{}/h", self.permits)
        } else {
            write!(f, "{}/{}ms", self.permits, self.per.as_millis())
        }
    }
}

impl FromStr for RateLimit {
    type Err = AppError;

    /// Parses `<n>`, `<n>/s`, `<n>/m` or `<n>/h`. A bare number means per second.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s.trim().split_once('/').unwrap_or((s.trim(), "s"));
        let permits: u32 = count
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigError(format!("Invalid rate limit '{s}'")))?;
        let per = match unit.trim() {
            "s" | "sec" => Duration::from_secs(1),
            "m" | "min" => Duration::from_secs(60),
            "h" | "hour" => Duration::from_secs(3600),
            other => {
                return Err(AppError::ConfigError(format!(
                    "Invalid rate limit unit '{other}' in '{s}' (expected s, m or h)"
                )));
            }
        };
        Self::new(permits, per)
    }
}

/// Shared gate in front of a rate-limited resource.
pub trait RateLimiter: Send + Sync + Clone {
    /// Wait until a permit is available and take it.
    fn acquire(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// In-process token bucket.
#[derive(Clone)]
pub struct TokenBucket {
    limit: RateLimit,
    capacity: f64,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    /// Bucket holding a single permit, so calls are spaced evenly.
    pub fn new(limit: RateLimit) -> Self {
        Self::with_burst(limit, 1)
    }

    /// Bucket allowing up to `burst` back-to-back permits after idling.
    pub fn with_burst(limit: RateLimit, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            limit,
            capacity,
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take a permit if one is available, otherwise report how long until
    /// the next one.
    async fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.limit.refill_per_sec()).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let wait = self.limit.interval().mul_f64(1.0 - state.tokens);
            Err(wait.max(Duration::from_millis(1)))
        }
    }
}

impl RateLimiter for TokenBucket {
    async fn acquire(&self) -> Result<(), AppError> {
        loop {
            match self.try_take().await {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    // Lock is released while sleeping so other callers can queue up.
                    tracing::debug!(wait_ms = %wait.as_millis(), "Rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// Limiter that never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    async fn acquire(&self) -> Result<(), AppError> {
        Ok(())
    }
}

//! Shared token-bucket admission control.
//!
//! A single [`RateLimiter`] gates transaction starts for the whole worker
//! pool, so the offered load seen by the server is bounded by the configured
//! rate regardless of how many workers run.  Grants are serialized through
//! one `tokio::sync::Mutex`; waiting for a token happens outside the lock and
//! races the process-wide cancellation token.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum LimiterError {
    #[error("rate must be a positive, finite number of tokens per second (got {0})")]
    InvalidRate(f64),

    #[error("burst must be at least 1")]
    ZeroBurst,
}

/// Outcome of [`RateLimiter::acquire`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed; the caller may start one transaction.
    Granted,
    /// The cancellation token fired first; the caller must stop.
    Cancelled,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

struct Bucket {
    /// Available tokens.  Goes negative while callers hold reservations
    /// they are still sleeping on.
    tokens: f64,
    last_refill: Instant,
    /// Latest grant time handed out so far.
    last_grant: Instant,
}

/// Token bucket with a sustained rate and a burst ceiling.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    /// Create a limiter that starts full.
    pub fn new(rate_per_sec: f64, burst: u32) -> Result<Self, LimiterError> {
        if !rate_per_sec.is_finite() || rate_per_sec <= 0.0 {
            return Err(LimiterError::InvalidRate(rate_per_sec));
        }
        if burst == 0 {
            return Err(LimiterError::ZeroBurst);
        }

        let now = Instant::now();
        Ok(Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: now,
                last_grant: now,
            }),
            rate: rate_per_sec,
            burst: f64::from(burst),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    /// Wait for one token or for `cancel` to fire, whichever comes first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Admission {
        if cancel.is_cancelled() {
            return Admission::Cancelled;
        }

        let grant_at = self.reserve().await;
        let now = Instant::now();
        if grant_at <= now {
            return Admission::Granted;
        }

        trace!(wait_ms = (grant_at - now).as_millis() as u64, "waiting for rate token");
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                self.refund(grant_at).await;
                Admission::Cancelled
            }
            _ = tokio::time::sleep_until(grant_at) => Admission::Granted,
        }
    }

    /// Take one token now and return the instant at which it is actually
    /// earned.
    async fn reserve(&self) -> Instant {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        self.refill(&mut bucket, now);

        bucket.tokens -= 1.0;
        let grant_at = if bucket.tokens >= 0.0 {
            now
        } else {
            now + Duration::from_secs_f64(-bucket.tokens / self.rate)
        };
        bucket.last_grant = bucket.last_grant.max(grant_at);
        grant_at
    }

    /// Give back a reservation whose holder was cancelled before using it.
    ///
    /// Callers that reserved later already sleep until fixed instants, so
    /// only the part of the token not spoken for by them is returned.  With
    /// later waiters a full interval behind, nothing is returned.
    async fn refund(&self, grant_at: Instant) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());

        let claimed_later = bucket.last_grant.saturating_duration_since(grant_at);
        let restore = 1.0 - claimed_later.as_secs_f64() * self.rate;
        if restore > 0.0 {
            bucket.tokens = (bucket.tokens + restore).min(self.burst);
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

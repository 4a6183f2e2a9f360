//! Token bucket arithmetic.

use std::time::Duration;

use tokio::time::Instant;

/// A continuously refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, refill_rate: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_rate: f64::from(refill_rate),
            last_refill: now,
        }
    }

    /// Tokens currently available, as of the last check.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Adopts a new capacity and refill rate, keeping accrued tokens up to the new capacity.
    pub fn reconfigure(&mut self, capacity: u32, refill_rate: u32) {
        self.capacity = f64::from(capacity);
        self.refill_rate = f64::from(refill_rate);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Whether the bucket was built with these parameters.
    pub fn matches(&self, capacity: u32, refill_rate: u32) -> bool {
        self.capacity == f64::from(capacity) && self.refill_rate == f64::from(refill_rate)
    }

    /// Refills, then takes one token. On denial returns the time until a token is available.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        self.tokens = self.capacity.min(self.tokens + elapsed * self.refill_rate);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - self.tokens;

        Err(Duration::from_secs_f64(missing / self.refill_rate))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::TokenBucket;

    #[test]
    fn starts_full_and_drains() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, 1, start);

        assert!(bucket.try_take(start).is_ok());
        assert!(bucket.try_take(start).is_ok());
        assert!(bucket.try_take(start).is_ok());

        let retry_after = bucket.try_take(start).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(1));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 10, start);

        bucket.try_take(start).unwrap();
        bucket.try_take(start + Duration::from_secs(60)).unwrap();

        assert_eq!(bucket.tokens(), 1.0);
    }

    #[test]
    fn partial_refill_reports_remaining_wait() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 4, start);

        bucket.try_take(start).unwrap();

        let retry_after = bucket.try_take(start + Duration::from_millis(125)).unwrap_err();
        assert_eq!(retry_after, Duration::from_millis(125));
    }

    #[test]
    fn reconfigure_clamps_tokens() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10, 10, start);

        bucket.reconfigure(2, 1);

        assert_eq!(bucket.tokens(), 2.0);
        assert!(bucket.matches(2, 1));
        assert!(!bucket.matches(10, 10));
    }
}

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Per-connection token bucket.
///
/// Refill is computed lazily on each consume attempt as
/// `min(capacity, tokens + elapsed * rate)`. A capacity of B with rate R
/// admits a burst of B messages and a sustained R messages per second.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: u32,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(capacity: u32, rate: f64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Attempts to consume one token. Returns `false` when the bucket is
    /// exhausted, which the caller treats as a rate breach.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(f64::from(self.capacity));
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// Bounds stale per-IP entries between prune passes.
const MAX_TRACKED_IPS: usize = 100_000;

/// Sliding-window request limiter keyed by client IP, used for the HTTP
/// surface. Tracks individual request timestamps so a burst straddling a
/// window boundary cannot double its budget.
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max: u32,
    hits: DashMap<IpAddr, VecDeque<Instant>>,
}

impl SlidingWindow {
    /// Creates a limiter admitting `max` requests per `window` per IP.
    #[must_use]
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            hits: DashMap::new(),
        }
    }

    /// Records a request from `ip` and reports whether it is admitted.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        if self.hits.len() > MAX_TRACKED_IPS {
            self.prune_at(now);
        }

        let mut entry = self.hits.entry(ip).or_default();
        while let Some(front) = entry.front() {
            if now.saturating_duration_since(*front) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.max as usize {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Drops IPs whose most recent request left the window. Called from
    /// the heartbeat sweep.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
        });
    }
}

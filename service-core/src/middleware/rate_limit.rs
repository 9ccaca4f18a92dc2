//! Per-tenant request limiting.
//!
//! Each key (usually an organization id) gets a fixed window of
//! `max_requests` per `window`. With `skip_successful_requests` enabled,
//! callers refund the slot once the request succeeds so only failures count.
//! A refund only lands in the window that granted the slot.

use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub skip_successful_requests: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            window: Duration::from_secs(60),
            skip_successful_requests: false,
        }
    }
}

/// Identifies the window a slot was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowId(Instant);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32, window: WindowId },
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Rate limiter keyed by tenant id.
#[derive(Debug, Clone)]
pub struct TenantRateLimiter {
    config: RateLimitConfig,
    windows: Arc<DashMap<String, Window>>,
}

impl TenantRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RateLimitConfig {
                max_requests: config.max_requests.max(1),
                ..config
            },
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one slot for `key`.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + self.config.window,
        });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.config.window;
        }

        if entry.count >= self.config.max_requests {
            let retry_after = entry.reset_at.saturating_duration_since(now);
            tracing::debug!(key = %key, retry_after_ms = retry_after.as_millis() as u64, "Tenant rate limit exceeded");
            return RateLimitDecision::Limited { retry_after };
        }

        entry.count += 1;
        RateLimitDecision::Allowed {
            remaining: self.config.max_requests - entry.count,
            window: WindowId(entry.reset_at),
        }
    }

    /// Give back a slot taken by `check` when the request succeeded and the
    /// limiter is configured to count failures only. Ignored once `window`
    /// has rolled over.
    pub fn record_success(&self, key: &str, window: WindowId) {
        if !self.config.skip_successful_requests {
            return;
        }
        if let Some(mut entry) = self.windows.get_mut(key) {
            if WindowId(entry.reset_at) != window {
                tracing::debug!(key = %key, "Window rolled over, refund skipped");
                return;
            }
            entry.count = entry.count.saturating_sub(1);
        }
    }

    /// Drop expired windows.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| window.reset_at > now);
    }
}

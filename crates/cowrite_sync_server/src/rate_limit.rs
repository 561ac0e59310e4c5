//! Chat flood control.
//!
//! Each user gets a sliding window of send timestamps. The window is
//! consulted on every `send-message`; relays and presence traffic are
//! deliberately unlimited, since they are already coalesced client-side.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sliding-window limiter for chat messages, one window per user.
#[derive(Clone, Default)]
pub struct ChatRateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl ChatRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send attempt for `user_id`.
    ///
    /// Allows up to `limit` messages per `window`. When the user is over
    /// the limit, returns the number of seconds until their oldest send
    /// falls out of the window.
    pub fn try_send(&self, user_id: &str, limit: usize, window: Duration) -> Result<(), u64> {
        let now = Instant::now();
        let mut sends = self.windows.entry(user_id.to_string()).or_default();

        while sends.front().is_some_and(|t| now.duration_since(*t) >= window) {
            sends.pop_front();
        }

        if sends.len() >= limit {
            let oldest = *sends.front().ok_or(1u64)?;
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.as_secs().max(1));
        }

        sends.push_back(now);
        Ok(())
    }

    /// Drop windows whose newest send is older than `max_idle`. Run
    /// periodically so departed users do not accumulate entries.
    pub fn prune(&self, max_idle: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, sends| sends.back().is_some_and(|t| now.duration_since(*t) < max_idle));
    }
}

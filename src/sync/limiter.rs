//! Outbound pacing.
//!
//! LoRa airtime is the scarcest resource the BBS has, so every outbound
//! frame class has a minimum spacing and callers cooperatively await the
//! remaining interval before transmitting. Spacing is tracked pairwise per
//! class, not per conversation. Mail chunks get a small upward jitter so
//! two stations in lockstep drift apart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendClass {
    /// Any unicast frame (protocol control, command replies).
    Unicast,
    /// MAILDAT fragments.
    MailChunk,
    /// BOARDDAT fragments.
    BoardChunk,
}

/// Remaining wait before a send is allowed, given the last send time.
fn remaining_gap(last: Option<Instant>, gap: Duration, now: Instant) -> Duration {
    match last {
        Some(at) if now < at + gap => (at + gap) - now,
        _ => Duration::ZERO,
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    gaps: HashMap<SendClass, Duration>,
    last_sent: HashMap<SendClass, Instant>,
    /// Upward jitter applied to mail chunk spacing (ms).
    mail_jitter_ms: u64,
    sync_request_gap_us: i64,
    last_sync_request_us: HashMap<String, i64>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut gaps = HashMap::new();
        gaps.insert(SendClass::Unicast, Duration::from_millis(config.unicast_gap_ms));
        gaps.insert(
            SendClass::MailChunk,
            Duration::from_millis(config.mail_chunk_gap_ms),
        );
        gaps.insert(
            SendClass::BoardChunk,
            Duration::from_millis(config.board_chunk_gap_ms),
        );
        Self {
            gaps,
            last_sent: HashMap::new(),
            mail_jitter_ms: 200,
            sync_request_gap_us: config.sync_request_interval_seconds as i64 * 1_000_000,
            last_sync_request_us: HashMap::new(),
        }
    }

    /// Await until a frame of `class` may be sent, then claim the slot.
    pub async fn acquire(&mut self, class: SendClass) {
        let mut gap = *self.gaps.get(&class).unwrap_or(&Duration::ZERO);
        if class == SendClass::MailChunk && self.mail_jitter_ms > 0 {
            gap += Duration::from_millis(rand::thread_rng().gen_range(0..=self.mail_jitter_ms));
        }
        let wait = remaining_gap(self.last_sent.get(&class).copied(), gap, Instant::now());
        if !wait.is_zero() {
            sleep(wait).await;
        }
        self.last_sent.insert(class, Instant::now());
    }

    /// Per-peer throttle for BOARDREQ/sync solicitations. Claims the slot
    /// when it returns true.
    pub fn allow_sync_request(&mut self, peer_node: &str, now_us: i64) -> bool {
        let allowed = self
            .last_sync_request_us
            .get(peer_node)
            .is_none_or(|last| now_us - last >= self.sync_request_gap_us);
        if allowed {
            self.last_sync_request_us.insert(peer_node.to_string(), now_us);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_gap_computes_wait() {
        let now = Instant::now();
        assert_eq!(remaining_gap(None, Duration::from_secs(3), now), Duration::ZERO);

        let wait = remaining_gap(Some(now), Duration::from_secs(3), now);
        assert!(wait > Duration::from_millis(2900));

        let later = now + Duration::from_secs(5);
        assert_eq!(
            remaining_gap(Some(now), Duration::from_secs(3), later),
            Duration::ZERO
        );
    }

    #[test]
    fn sync_request_throttles_per_peer() {
        const S: i64 = 1_000_000;
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());
        assert!(limiter.allow_sync_request("!peer-a", 0));
        assert!(!limiter.allow_sync_request("!peer-a", 100 * S));
        // A different peer has its own budget.
        assert!(limiter.allow_sync_request("!peer-b", 100 * S));
        // The default five-minute window reopens the budget.
        assert!(limiter.allow_sync_request("!peer-a", 300 * S));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_spaces_consecutive_sends() {
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());
        let start = tokio::time::Instant::now();
        limiter.acquire(SendClass::Unicast).await;
        limiter.acquire(SendClass::Unicast).await;
        // With the default 3.5 s gap the second send waited.
        assert!(tokio::time::Instant::now() - start >= tokio::time::Duration::from_millis(3400));
    }
}

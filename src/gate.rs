//! Admission gate in front of booking commits.
//!
//! Rate limits and similar pass/fail checks live behind [`AdmissionGate`] so a
//! deployment with several instances can swap the in-process counter for a
//! shared keyed-counter service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub key: String,
    pub retry_after: Duration,
}

impl std::fmt::Display for Denied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "too many requests for {}; retry in {}s", self.key, self.retry_after.as_secs().max(1))
    }
}

impl std::error::Error for Denied {}

#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admit(&self, key: &str) -> Result<(), Denied>;
}

pub struct AllowAll;

#[async_trait]
impl AdmissionGate for AllowAll {
    async fn admit(&self, _key: &str) -> Result<(), Denied> {
        Ok(())
    }
}

struct Window {
    opened: Instant,
    count: u32,
}

/// Fixed-window counter per key. Windows expire explicitly: an expired window
/// is reset on the next hit and dropped by [`KeyedCounterGate::purge_expired`].
pub struct KeyedCounterGate {
    limit: u32,
    window: Duration,
    counters: DashMap<String, Window>,
}

impl KeyedCounterGate {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: DashMap::new(),
        }
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.counters.len();
        let window = self.window;
        self.counters.retain(|_, w| w.opened.elapsed() < window);
        before - self.counters.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl AdmissionGate for KeyedCounterGate {
    async fn admit(&self, key: &str) -> Result<(), Denied> {
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| Window {
            opened: Instant::now(),
            count: 0,
        });
        let elapsed = entry.opened.elapsed();
        if elapsed >= self.window {
            entry.opened = Instant::now();
            entry.count = 0;
        }
        if entry.count >= self.limit {
            return Err(Denied {
                key: key.to_string(),
                retry_after: self.window.saturating_sub(entry.opened.elapsed()),
            });
        }
        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let gate = KeyedCounterGate::new(2, Duration::from_secs(60));
        assert!(gate.admit("biz:alice").await.is_ok());
        assert!(gate.admit("biz:alice").await.is_ok());
        let denied = gate.admit("biz:alice").await.unwrap_err();
        assert_eq!(denied.key, "biz:alice");
        assert!(denied.retry_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let gate = KeyedCounterGate::new(1, Duration::from_secs(60));
        assert!(gate.admit("a").await.is_ok());
        assert!(gate.admit("b").await.is_ok());
        assert!(gate.admit("a").await.is_err());
    }

    #[tokio::test]
    async fn window_expires() {
        let gate = KeyedCounterGate::new(1, Duration::from_millis(30));
        assert!(gate.admit("a").await.is_ok());
        assert!(gate.admit("a").await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.purge_expired(), 1);
        assert_eq!(gate.tracked_keys(), 0);
        assert!(gate.admit("a").await.is_ok());
    }

    #[tokio::test]
    async fn allow_all_never_denies() {
        for _ in 0..100 {
            assert!(AllowAll.admit("x").await.is_ok());
        }
    }
}

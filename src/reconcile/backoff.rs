use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Per-key exponential backoff for reconcile failures. Entries clear on the
/// first success, so the map tracks only currently-failing keys.
#[derive(Clone)]
pub struct BackoffTracker {
    base: Duration,
    cap: Duration,
    entries: Arc<DashMap<Uuid, BackoffEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    retry_at: Instant,
}

impl BackoffTracker {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// True while the key is inside its backoff window.
    pub fn should_skip(&self, key: Uuid) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|e| Instant::now() < e.retry_at)
    }

    pub fn record_failure(&self, key: Uuid) {
        let failures = self.entries.get(&key).map_or(0, |e| e.failures) + 1;
        let delay = self.delay_for(failures);
        self.entries.insert(
            key,
            BackoffEntry {
                failures,
                retry_at: Instant::now() + delay,
            },
        );
    }

    pub fn record_success(&self, key: Uuid) {
        self.entries.remove(&key);
    }

    pub fn failing_keys(&self) -> usize {
        self.entries.len()
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(16)));
        let capped = exp.min(self.cap);
        // Full jitter keeps a burst of failing keys from retrying in lockstep.
        capped.mul_f64(rand::random::<f64>().max(0.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> BackoffTracker {
        BackoffTracker::new(Duration::from_millis(100), Duration::from_secs(300))
    }

    #[test]
    fn fresh_key_not_skipped() {
        assert!(!tracker().should_skip(Uuid::new_v4()));
    }

    #[test]
    fn failure_starts_backoff_window() {
        let t = tracker();
        let key = Uuid::new_v4();
        t.record_failure(key);
        assert!(t.should_skip(key));
    }

    #[test]
    fn success_clears_backoff() {
        let t = tracker();
        let key = Uuid::new_v4();
        t.record_failure(key);
        t.record_success(key);
        assert!(!t.should_skip(key));
        assert_eq!(t.failing_keys(), 0);
    }

    #[test]
    fn delay_envelope_is_capped() {
        let t = BackoffTracker::new(Duration::from_secs(1), Duration::from_secs(300));
        // After many failures the envelope saturates at the cap.
        let exp = Duration::from_secs(1).saturating_mul(2u32.saturating_pow(16));
        assert!(exp.min(Duration::from_secs(300)) == Duration::from_secs(300));
        for failures in 1..20 {
            let d = t.delay_for(failures);
            assert!(d <= Duration::from_secs(300));
        }
    }

    #[test]
    fn independent_keys() {
        let t = tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        t.record_failure(a);
        assert!(t.should_skip(a));
        assert!(!t.should_skip(b));
    }
}

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// At most one build per service at a time. Holding the key serializes
/// releases of one service (preserving image tag order and warm caches)
/// without blocking workers on other services' jobs.
#[derive(Clone, Default)]
pub struct SingleFlight {
    held: Arc<DashMap<Uuid, ()>>,
}

impl SingleFlight {
    /// Try to take the key. `None` means another worker holds it; the caller
    /// nacks with a short retry instead of waiting.
    pub fn try_acquire(&self, key: Uuid) -> Option<FlightGuard> {
        match self.held.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(FlightGuard {
                    held: self.held.clone(),
                    key,
                })
            }
        }
    }

    pub fn is_held(&self, key: Uuid) -> bool {
        self.held.contains_key(&key)
    }
}

/// Releases the key on every exit path, including panics and cancellation.
pub struct FlightGuard {
    held: Arc<DashMap<Uuid, ()>>,
    key: Uuid,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let sf = SingleFlight::default();
        let key = Uuid::new_v4();

        let guard = sf.try_acquire(key).expect("first acquire");
        assert!(sf.try_acquire(key).is_none());
        assert!(sf.is_held(key));

        drop(guard);
        assert!(!sf.is_held(key));
        assert!(sf.try_acquire(key).is_some());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let sf = SingleFlight::default();
        let _a = sf.try_acquire(Uuid::new_v4()).unwrap();
        let _b = sf.try_acquire(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn guard_releases_even_when_dropped_early() {
        let sf = SingleFlight::default();
        let key = Uuid::new_v4();
        {
            let _guard = sf.try_acquire(key).unwrap();
        }
        assert!(!sf.is_held(key));
    }
}

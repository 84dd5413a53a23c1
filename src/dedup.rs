//! Bounded "seen recently" set.
//!
//! Remembers keys for a retention window measured on the shared [`Clock`]
//! and never holds more than `max_entries`; the oldest keys go first.
//!
//! [`Clock`]: crate::clock::Clock

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

struct Inner {
    seen: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
}

pub struct DedupWindow {
    inner: Mutex<Inner>,
    retention_ms: u64,
    max_entries: usize,
}

impl DedupWindow {
    pub fn new(retention_ms: u64, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention_ms,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `key` at `now_ms`. Returns `true` if it was not already present
    /// inside the window.
    pub fn check_and_insert(&self, key: &str, now_ms: u64) -> bool {
        let mut inner = self.lock();
        Self::evict_expired(&mut inner, now_ms, self.retention_ms);
        if inner.seen.contains_key(key) {
            return false;
        }
        while inner.seen.len() >= self.max_entries {
            let Some((old, at)) = inner.order.pop_front() else {
                break;
            };
            if inner.seen.get(&old) == Some(&at) {
                inner.seen.remove(&old);
            }
        }
        inner.seen.insert(key.to_string(), now_ms);
        inner.order.push_back((key.to_string(), now_ms));
        true
    }

    pub fn contains(&self, key: &str, now_ms: u64) -> bool {
        let inner = self.lock();
        inner
            .seen
            .get(key)
            .is_some_and(|at| now_ms.saturating_sub(*at) < self.retention_ms)
    }

    /// Forget `key` so the next `check_and_insert` accepts it again.
    pub fn forget(&self, key: &str) -> bool {
        self.lock().seen.remove(key).is_some()
    }

    /// Drop everything older than the window. Returns the number evicted.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut inner = self.lock();
        let before = inner.seen.len();
        Self::evict_expired(&mut inner, now_ms, self.retention_ms);
        before - inner.seen.len()
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(inner: &mut Inner, now_ms: u64, retention_ms: u64) {
        while let Some((key, at)) = inner.order.front() {
            if now_ms.saturating_sub(*at) < retention_ms {
                break;
            }
            if inner.seen.get(key) == Some(at) {
                inner.seen.remove(key);
            }
            inner.order.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_inside_window_is_a_duplicate() {
        let w = DedupWindow::new(1_000, 100);
        assert!(w.check_and_insert("c1_f1", 0));
        assert!(!w.check_and_insert("c1_f1", 500));
        assert!(w.check_and_insert("c2_f1", 500));
    }

    #[test]
    fn keys_expire_after_retention() {
        let w = DedupWindow::new(1_000, 100);
        assert!(w.check_and_insert("k", 0));
        assert!(w.contains("k", 999));
        assert!(!w.contains("k", 1_000));
        assert!(w.check_and_insert("k", 1_000));
    }

    #[test]
    fn size_bound_evicts_oldest_first() {
        let w = DedupWindow::new(60_000, 2);
        w.check_and_insert("a", 0);
        w.check_and_insert("b", 1);
        w.check_and_insert("c", 2);
        assert_eq!(w.len(), 2);
        assert!(!w.contains("a", 3));
        assert!(w.contains("b", 3));
        assert!(w.contains("c", 3));
    }

    #[test]
    fn forgotten_key_is_accepted_again() {
        let w = DedupWindow::new(1_000, 100);
        assert!(w.check_and_insert("k", 0));
        assert!(w.forget("k"));
        assert!(!w.forget("k"));
        assert!(w.check_and_insert("k", 10));
        assert!(!w.check_and_insert("k", 20));
    }

    #[test]
    fn sweep_reports_evictions() {
        let w = DedupWindow::new(10, 100);
        w.check_and_insert("a", 0);
        w.check_and_insert("b", 5);
        assert_eq!(w.sweep(12), 1);
        assert_eq!(w.sweep(100), 1);
        assert!(w.is_empty());
    }
}

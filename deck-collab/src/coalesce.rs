//! Per-key update coalescing.
//!
//! High-frequency block edits (typing, dragging, resizing) are merged over a
//! fixed window so the authority sees one `update-block` per key per window
//! instead of one per keystroke or pointer event.
//!
//! ```text
//!   offer(k, v1) ──► window opens (deadline = now + window)
//!   offer(k, v2) ──► pending value replaced, deadline unchanged
//!   offer(k, v3) ──► pending value replaced
//!   deadline     ──► take_due() yields (k, v3) exactly once
//! ```
//!
//! Time is passed in explicitly so callers decide the clock; the session
//! uses `tokio::time::Instant`, which honours a paused test runtime.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Which part of a block an update touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Content,
    Position,
    Size,
}

/// Coalescing key: one window per block and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
    pub block_id: String,
    pub kind: UpdateKind,
}

impl CoalesceKey {
    pub fn new(block_id: impl Into<String>, kind: UpdateKind) -> Self {
        Self {
            block_id: block_id.into(),
            kind,
        }
    }

    /// Key under which the offline queue keeps only the latest value.
    ///
    /// Shared by every kind: a flushed update carries the whole block.
    pub fn queue_key(&self) -> String {
        format!("update-block:{}", self.block_id)
    }
}

#[derive(Debug)]
struct Pending<V> {
    value: V,
    deadline: Instant,
    /// Order in which the window opened.
    seq: u64,
}

/// Latest-value-wins buffer with one window per key.
#[derive(Debug)]
pub struct Coalescer<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V> Coalescer<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `value` for `key`.
    ///
    /// Returns `true` when this opened a new window.
    pub fn offer(&mut self, key: K, value: V, now: Instant) -> bool {
        if let Some(pending) = self.pending.get_mut(&key) {
            pending.value = value;
            return false;
        }
        self.next_seq += 1;
        self.pending.insert(
            key,
            Pending {
                value,
                deadline: now + self.window,
                seq: self.next_seq,
            },
        );
        true
    }

    /// Earliest deadline among pending keys.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every entry whose window has closed, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        self.remove_ordered(due)
    }

    /// Remove and return everything pending, oldest first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let keys: Vec<K> = self.pending.keys().cloned().collect();
        self.remove_ordered(keys)
    }

    fn remove_ordered(&mut self, keys: Vec<K>) -> Vec<(K, V)> {
        let mut taken: Vec<(u64, K, V)> = keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (p.seq, k, p.value)))
            .collect();
        taken.sort_by_key(|(seq, _, _)| *seq);
        taken.into_iter().map(|(_, k, v)| (k, v)).collect()
    }

    /// Drop pending entries whose key matches. Returns how many were dropped.
    pub fn cancel_where(&mut self, mut matches: impl FnMut(&K) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|k, _| !matches(k));
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    fn key(block: &str, kind: UpdateKind) -> CoalesceKey {
        CoalesceKey::new(block, kind)
    }

    #[test]
    fn test_updates_inside_window_collapse_to_latest() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(WINDOW);
        let k = key("b1", UpdateKind::Position);

        assert!(c.offer(k.clone(), 1, t0));
        assert!(!c.offer(k.clone(), 2, t0 + Duration::from_millis(30)));
        assert!(!c.offer(k.clone(), 3, t0 + Duration::from_millis(60)));

        assert!(c.take_due(t0 + Duration::from_millis(99)).is_empty());
        assert_eq!(c.take_due(t0 + WINDOW), vec![(k, 3)]);
        assert!(c.is_empty());
    }

    #[test]
    fn test_each_key_has_its_own_window() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(WINDOW);
        let pos = key("b1", UpdateKind::Position);
        let content = key("b1", UpdateKind::Content);

        c.offer(pos.clone(), "p", t0);
        c.offer(content.clone(), "c", t0 + Duration::from_millis(50));

        assert_eq!(c.next_deadline(), Some(t0 + WINDOW));
        assert_eq!(c.take_due(t0 + WINDOW), vec![(pos, "p")]);
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_millis(150)));
        assert_eq!(c.take_due(t0 + Duration::from_millis(150)), vec![(content, "c")]);
    }

    #[test]
    fn test_new_window_after_flush() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(WINDOW);
        let k = key("b1", UpdateKind::Size);

        c.offer(k.clone(), 1, t0);
        c.take_due(t0 + WINDOW);
        assert!(c.offer(k.clone(), 2, t0 + Duration::from_millis(120)));
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_millis(220)));
    }

    #[test]
    fn test_drain_returns_everything_in_open_order() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(WINDOW);
        c.offer(key("b2", UpdateKind::Content), 2, t0 + Duration::from_millis(5));
        c.offer(key("b1", UpdateKind::Content), 1, t0);
        c.offer(key("b3", UpdateKind::Content), 3, t0 + Duration::from_millis(10));

        let values: Vec<_> = c.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![2, 1, 3]);
        assert!(c.next_deadline().is_none());
    }

    #[test]
    fn test_cancel_by_block() {
        let t0 = Instant::now();
        let mut c = Coalescer::new(WINDOW);
        c.offer(key("b1", UpdateKind::Content), 1, t0);
        c.offer(key("b1", UpdateKind::Position), 1, t0);
        c.offer(key("b2", UpdateKind::Position), 1, t0);

        assert_eq!(c.cancel_where(|k| k.block_id == "b1"), 2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.drain(), vec![(key("b2", UpdateKind::Position), 1)]);
    }

    #[test]
    fn test_queue_key_is_per_block() {
        assert_eq!(
            key("b1", UpdateKind::Content).queue_key(),
            key("b1", UpdateKind::Position).queue_key()
        );
        assert_ne!(
            key("b1", UpdateKind::Content).queue_key(),
            key("b2", UpdateKind::Content).queue_key()
        );
    }
}

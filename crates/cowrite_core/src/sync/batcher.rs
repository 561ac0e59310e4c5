//! Outbound coalescing for document updates and awareness state.
//!
//! Both batchers are pure state machines over `tokio::time::Instant`; the
//! async driving (sleeping until the deadline, checking connectivity) lives
//! in [`agent`](super::agent). Keeping them synchronous makes the latency
//! contract directly testable.
//!
//! The contract, identical for both channels:
//!
//! - The FIRST pending change arms the window; later changes never re-arm
//!   it. Worst-case send latency is therefore bounded by one window length
//!   regardless of how long an edit burst lasts.
//! - Disarming the timer (connection drop, shutdown) never discards queued
//!   content; only draining does. Rearming schedules a fresh window for a
//!   kept backlog after a rejoin.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Merges several queued document updates into a single payload.
///
/// This is the seam to the external CRDT library: its merge must be
/// associative and commutative so that coalescing N local updates into one
/// message cannot change the converged document. Nothing in this crate
/// inspects the bytes.
pub trait UpdateMerger: Send + Sync {
    fn merge(&self, updates: &[Vec<u8>]) -> Vec<u8>;
}

/// Length-prefixed concatenation merger.
///
/// Suitable for CRDTs whose update decoder accepts a sequence of updates
/// (each prefixed with a u32-le length). Real deployments usually inject
/// the replication library's own merge instead.
pub struct ConcatMerger;

impl UpdateMerger for ConcatMerger {
    fn merge(&self, updates: &[Vec<u8>]) -> Vec<u8> {
        if updates.len() == 1 {
            return updates[0].clone();
        }
        let mut out = Vec::with_capacity(updates.iter().map(|u| u.len() + 4).sum());
        for update in updates {
            out.extend_from_slice(&(update.len() as u32).to_le_bytes());
            out.extend_from_slice(update);
        }
        out
    }
}

/// Coalesces local document updates into one outbound send per window.
#[derive(Debug)]
pub struct UpdateBatcher {
    window: Duration,
    queue: Vec<Vec<u8>>,
    deadline: Option<Instant>,
}

impl UpdateBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            queue: Vec::new(),
            deadline: None,
        }
    }

    /// Queue a local update. Returns the flush deadline if this change
    /// armed the window; `None` while a window is already pending.
    pub fn push(&mut self, update: Vec<u8>, now: Instant) -> Option<Instant> {
        self.queue.push(update);
        if self.deadline.is_none() {
            let deadline = now + self.window;
            self.deadline = Some(deadline);
            Some(deadline)
        } else {
            None
        }
    }

    /// The pending flush deadline, if a window is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the armed window has elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    /// Number of updates waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Clear the timer without touching the queue. Used when the connection
    /// drops: the backlog survives and a fresh window is armed on rejoin.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Arm a fresh window for an existing backlog. Returns the new deadline,
    /// or `None` when the queue is empty or a window is already pending.
    pub fn rearm(&mut self, now: Instant) -> Option<Instant> {
        if self.queue.is_empty() || self.deadline.is_some() {
            return None;
        }
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        Some(deadline)
    }

    /// Drain the queue into a single merged payload, clearing the timer.
    /// Returns `None` when nothing is queued.
    pub fn drain(&mut self, merger: &dyn UpdateMerger) -> Option<Vec<u8>> {
        self.deadline = None;
        if self.queue.is_empty() {
            return None;
        }
        let updates = std::mem::take(&mut self.queue);
        Some(merger.merge(&updates))
    }

    /// Drop all pending state (agent shutdown).
    pub fn clear(&mut self) {
        self.deadline = None;
        self.queue.clear();
    }
}

/// Latest-wins awareness snapshot: one value per field.
pub type AwarenessSnapshot = BTreeMap<String, Vec<u8>>;

/// Encode an awareness snapshot as the outbound payload.
///
/// This is the client's OWN presence state, so encoding it locally does not
/// violate the opaque-payload boundary; the server and remote peers still
/// treat the result as bytes. Fields are base64 inside a JSON object, with
/// deterministic (sorted) field order.
pub fn encode_awareness(snapshot: &AwarenessSnapshot) -> Vec<u8> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    let map: BTreeMap<&str, String> = snapshot
        .iter()
        .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
        .collect();
    // Serializing a string map cannot fail.
    serde_json::to_vec(&map).unwrap_or_default()
}

/// Throttles local awareness changes (cursor, selection, color, name).
///
/// Same window discipline as [`UpdateBatcher`] but with replace semantics:
/// awareness is state, not a log, so only the latest value per field
/// survives to the flush.
#[derive(Debug)]
pub struct AwarenessThrottler {
    window: Duration,
    fields: AwarenessSnapshot,
    deadline: Option<Instant>,
}

impl AwarenessThrottler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            fields: BTreeMap::new(),
            deadline: None,
        }
    }

    /// Record the latest value for a field. Returns the flush deadline if
    /// this change armed the window.
    pub fn set(&mut self, field: impl Into<String>, value: Vec<u8>, now: Instant) -> Option<Instant> {
        self.fields.insert(field.into(), value);
        if self.deadline.is_none() {
            let deadline = now + self.window;
            self.deadline = Some(deadline);
            Some(deadline)
        } else {
            None
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    pub fn pending(&self) -> usize {
        self.fields.len()
    }

    /// Clear the timer, keeping pending fields (connection dropped).
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Arm a fresh window for pending fields. Returns the new deadline, or
    /// `None` when nothing is pending or a window is already armed.
    pub fn rearm(&mut self, now: Instant) -> Option<Instant> {
        if self.fields.is_empty() || self.deadline.is_some() {
            return None;
        }
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        Some(deadline)
    }

    /// Drain the pending snapshot, clearing the timer.
    pub fn drain(&mut self) -> Option<AwarenessSnapshot> {
        self.deadline = None;
        if self.fields.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.fields))
    }

    pub fn clear(&mut self) {
        self.deadline = None;
        self.fields.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(250);

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_produces_one_send() {
        let mut batcher = UpdateBatcher::new(WINDOW);
        let t0 = Instant::now();

        // Edits at t=0, 50, 100 ms
        let armed = batcher.push(b"a".to_vec(), t0);
        assert_eq!(armed, Some(t0 + WINDOW));
        assert_eq!(batcher.push(b"b".to_vec(), t0 + Duration::from_millis(50)), None);
        assert_eq!(batcher.push(b"c".to_vec(), t0 + Duration::from_millis(100)), None);

        // Window is measured from the FIRST change, not the last
        assert_eq!(batcher.deadline(), Some(t0 + WINDOW));
        assert!(!batcher.is_due(t0 + Duration::from_millis(249)));
        assert!(batcher.is_due(t0 + WINDOW));

        // Exactly one merged payload comes out
        let payload = batcher.drain(&ConcatMerger).unwrap();
        assert!(!payload.is_empty());
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_after_flush_arms_independent_window() {
        let mut batcher = UpdateBatcher::new(WINDOW);
        let t0 = Instant::now();

        batcher.push(b"a".to_vec(), t0);
        batcher.drain(&ConcatMerger).unwrap();

        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(batcher.push(b"b".to_vec(), t1), Some(t1 + WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_keeps_backlog() {
        let mut batcher = UpdateBatcher::new(WINDOW);
        let t0 = Instant::now();

        batcher.push(b"a".to_vec(), t0);
        batcher.disarm();
        assert_eq!(batcher.pending(), 1);
        assert_eq!(batcher.deadline(), None);

        // Next change arms a fresh window and the backlog rides along
        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(batcher.push(b"b".to_vec(), t1), Some(t1 + WINDOW));
        let payload = batcher.drain(&ConcatMerger).unwrap();
        // Two length-prefixed updates
        assert_eq!(payload.len(), 4 + 1 + 4 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_schedules_a_window_only_for_a_backlog() {
        let mut batcher = UpdateBatcher::new(WINDOW);
        let t0 = Instant::now();

        // Nothing queued: nothing to schedule
        assert_eq!(batcher.rearm(t0), None);

        batcher.push(b"a".to_vec(), t0);
        batcher.disarm();

        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(batcher.rearm(t1), Some(t1 + WINDOW));
        // Already armed: rearm is a no-op
        assert_eq!(batcher.rearm(t1), None);
        assert_eq!(batcher.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_update_is_passed_through_unframed() {
        let mut batcher = UpdateBatcher::new(WINDOW);
        batcher.push(vec![9, 9, 9], Instant::now());
        assert_eq!(batcher.drain(&ConcatMerger).unwrap(), vec![9, 9, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn awareness_latest_value_per_field_wins() {
        let mut throttler = AwarenessThrottler::new(Duration::from_millis(400));
        let t0 = Instant::now();

        let armed = throttler.set("cursor", b"1:1".to_vec(), t0);
        assert_eq!(armed, Some(t0 + Duration::from_millis(400)));
        assert_eq!(
            throttler.set("cursor", b"1:9".to_vec(), t0 + Duration::from_millis(10)),
            None
        );
        throttler.set("color", b"#ff0000".to_vec(), t0 + Duration::from_millis(20));

        let snapshot = throttler.drain().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["cursor"], b"1:9".to_vec());
        assert_eq!(snapshot["color"], b"#ff0000".to_vec());
        assert_eq!(throttler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn awareness_drain_empty_is_none() {
        let mut throttler = AwarenessThrottler::new(Duration::from_millis(400));
        assert!(throttler.drain().is_none());
    }

    #[test]
    fn encode_awareness_is_deterministic() {
        let mut a = AwarenessSnapshot::new();
        a.insert("cursor".to_string(), b"3:14".to_vec());
        a.insert("color".to_string(), b"#00ff00".to_vec());

        let mut b = AwarenessSnapshot::new();
        b.insert("color".to_string(), b"#00ff00".to_vec());
        b.insert("cursor".to_string(), b"3:14".to_vec());

        assert_eq!(encode_awareness(&a), encode_awareness(&b));
        assert!(!encode_awareness(&a).is_empty());
    }
}

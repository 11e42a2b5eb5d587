//! Optional per-transaction cache-event tracing.
//!
//! `CacheEventTrace` correlates events reported by each cache level into a classified
//! transaction shape with a per-stage latency breakdown. It holds no state the protocol
//! itself depends on; components function identically whether or not a trace is attached.

use std::collections::HashMap;

use crate::common::LineIndex;

/// A single correlation event reported by a cache level for one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// The L1 missed and issued a request.
    L1Miss,
    /// The LLC answered directly from its resident block.
    L2Hit,
    /// The LLC missed and had to fetch from memory.
    L2Miss,
    /// The LLC resolved the request by forwarding to a current owner/sharer.
    L2Forward,
    /// The memory node completed the backing fetch.
    MemoryHandled,
    /// The LLC-side leg of the transaction finished.
    L2Finish,
    /// The L1-side leg of the transaction finished (data installed).
    L1Finish,
}

/// The classified shape of a completed transaction, one of six per `spec.md` §4.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionShape {
    /// L1 miss resolved directly by an LLC hit.
    L1MissL2Hit,
    /// L1 miss resolved by the LLC forwarding to another sharer/owner.
    L1MissL2Forward,
    /// L1 miss, LLC miss, resolved by a (conceptual) L3 hit.
    L1MissL2MissL3Hit,
    /// L1 miss, LLC miss, resolved by an L3-level forward.
    L1MissL2MissL3Forward,
    /// L1 miss, LLC miss, and an L3 miss requiring a full memory round trip.
    L1MissL2MissL3Miss,
    /// The transaction was canceled by a reorder/replay before completing.
    ReorderCanceled,
}

#[derive(Default)]
struct PendingTransaction {
    events: Vec<(TraceEvent, u64)>,
    start_tick: u64,
}

/// Per-stage latency totals, accumulated per classified shape.
#[derive(Debug, Default, Clone)]
pub struct ShapeLatency {
    /// Number of transactions classified into this shape.
    pub count: u64,
    /// Sum of end-to-end latencies (ticks from first event to `L1Finish`).
    pub total_ticks: u64,
}

/// Collects and classifies per-transaction events across all cache levels.
#[derive(Default)]
pub struct CacheEventTrace {
    pending: HashMap<(u32, LineIndex), PendingTransaction>,
    latencies: HashMap<TransactionShapeKey, ShapeLatency>,
}

/// `TransactionShape` doesn't implement `Hash`; this mirrors it for map keys without
/// forcing every caller to derive `Hash` on a type that's otherwise plain data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TransactionShapeKey {
    L1MissL2Hit,
    L1MissL2Forward,
    L1MissL2MissL3Hit,
    L1MissL2MissL3Forward,
    L1MissL2MissL3Miss,
    ReorderCanceled,
}

impl From<TransactionShape> for TransactionShapeKey {
    fn from(s: TransactionShape) -> Self {
        match s {
            TransactionShape::L1MissL2Hit => Self::L1MissL2Hit,
            TransactionShape::L1MissL2Forward => Self::L1MissL2Forward,
            TransactionShape::L1MissL2MissL3Hit => Self::L1MissL2MissL3Hit,
            TransactionShape::L1MissL2MissL3Forward => Self::L1MissL2MissL3Forward,
            TransactionShape::L1MissL2MissL3Miss => Self::L1MissL2MissL3Miss,
            TransactionShape::ReorderCanceled => Self::ReorderCanceled,
        }
    }
}

impl CacheEventTrace {
    /// Creates an empty trace collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event` for the transaction identified by `(requester, line)` at `tick`.
    pub fn record(&mut self, requester: u32, line: LineIndex, event: TraceEvent, tick: u64) {
        let key = (requester, line);
        let pending = self.pending.entry(key).or_insert_with(|| PendingTransaction {
            events: Vec::new(),
            start_tick: tick,
        });
        pending.events.push((event, tick));

        if event == TraceEvent::L1Finish {
            let tx = self.pending.remove(&key).expect("just inserted above");
            let shape = classify(&tx.events);
            let entry = self.latencies.entry(shape.into()).or_default();
            entry.count += 1;
            entry.total_ticks += tick.saturating_sub(tx.start_tick);
        }
    }

    /// Marks the transaction at `(requester, line)` as canceled by a reorder/replay,
    /// removing it from the pending set without contributing to any other shape's stats.
    pub fn cancel(&mut self, requester: u32, line: LineIndex) {
        if self.pending.remove(&(requester, line)).is_some() {
            self.latencies
                .entry(TransactionShapeKey::ReorderCanceled)
                .or_default()
                .count += 1;
        }
    }

    /// Returns the accumulated latency stats for `shape`.
    #[must_use]
    pub fn latency_for(&self, shape: TransactionShape) -> ShapeLatency {
        self.latencies.get(&shape.into()).cloned().unwrap_or_default()
    }
}

fn classify(events: &[(TraceEvent, u64)]) -> TransactionShape {
    let has = |e: TraceEvent| events.iter().any(|(ev, _)| *ev == e);
    if has(TraceEvent::L2Forward) {
        if has(TraceEvent::MemoryHandled) {
            TransactionShape::L1MissL2MissL3Forward
        } else {
            TransactionShape::L1MissL2Forward
        }
    } else if has(TraceEvent::L2Miss) {
        if has(TraceEvent::MemoryHandled) {
            TransactionShape::L1MissL2MissL3Miss
        } else {
            TransactionShape::L1MissL2MissL3Hit
        }
    } else if has(TraceEvent::L2Hit) {
        TransactionShape::L1MissL2Hit
    } else {
        TransactionShape::ReorderCanceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_a_plain_llc_hit() {
        let mut t = CacheEventTrace::new();
        let line = LineIndex::new(1);
        t.record(0, line, TraceEvent::L1Miss, 0);
        t.record(0, line, TraceEvent::L2Hit, 1);
        t.record(0, line, TraceEvent::L1Finish, 3);
        let stats = t.latency_for(TransactionShape::L1MissL2Hit);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_ticks, 3);
    }

    #[test]
    fn classifies_a_forward_through_the_llc() {
        let mut t = CacheEventTrace::new();
        let line = LineIndex::new(2);
        t.record(1, line, TraceEvent::L1Miss, 10);
        t.record(1, line, TraceEvent::L2Forward, 11);
        t.record(1, line, TraceEvent::L1Finish, 15);
        assert_eq!(t.latency_for(TransactionShape::L1MissL2Forward).count, 1);
    }

    #[test]
    fn cancellation_is_tracked_separately() {
        let mut t = CacheEventTrace::new();
        let line = LineIndex::new(3);
        t.record(2, line, TraceEvent::L1Miss, 0);
        t.cancel(2, line);
        assert_eq!(t.latency_for(TransactionShape::ReorderCanceled).count, 1);
    }
}

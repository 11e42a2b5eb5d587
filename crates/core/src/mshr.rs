//! Per-line in-flight transaction tracking (Miss Status Holding Registers).
//!
//! An L1 or the DMA engine holds at most one MSHR per line (`spec.md` invariant #5); a
//! CPU request that hits a line already covered by an MSHR is stalled or folded into the
//! in-flight transaction rather than issuing a second one.

use std::collections::HashMap;

use crate::common::addr::LINE_BYTES;
use crate::common::LineIndex;
use crate::line::CacheLine;

/// The nine transient states a line passes through while an MSHR covers it.
///
/// Named `<from>to<to>`: the line's last stable state, then the state it is converging to.
/// `I` appears on both ends for the all-the-way-gone case (`ItoI`), used when an
/// `Invalidate` arrives for a line whose fetch hasn't completed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransientState {
    /// Invalid converging to Shared: an outstanding `GetS` on a line with no prior copy.
    ItoS,
    /// Invalid converging to Modified: an outstanding `GetM` on a line with no prior copy.
    ItoM,
    /// Shared converging to Modified: an upgrade `GetM` issued from a store that hit S.
    StoM,
    /// Owned converging to Modified: an upgrade `GetM` issued from a store that hit O.
    OtoM,
    /// Shared converging to Invalid: a voluntary writeback (`PutS`) in flight.
    StoI,
    /// Modified converging to Invalid: a voluntary writeback (`PutM`) in flight.
    MtoI,
    /// Exclusive converging to Invalid: a voluntary writeback (`PutE`) in flight.
    EtoI,
    /// Owned converging to Invalid: a voluntary writeback (`PutO`) in flight.
    OtoI,
    /// Already-invalid line with an MSHR present only to absorb a race (e.g. an
    /// `Invalidate` that arrived before a `GetS`/`GetM` response did).
    ItoI,
}

impl TransientState {
    /// Coalesces this transient state upon receipt of an `Invalidate` for the same line,
    /// per `spec.md` §4.2's transition table.
    #[must_use]
    pub const fn coalesce_on_invalidate(self) -> Self {
        match self {
            Self::StoI | Self::MtoI | Self::OtoI | Self::ItoI | Self::ItoS => Self::ItoI,
            Self::OtoM | Self::StoM | Self::ItoM => Self::ItoM,
            Self::EtoI => Self::ItoI,
        }
    }

    /// Returns whether this transient state is converging toward a writable (M) target.
    #[must_use]
    pub const fn targets_modified(self) -> bool {
        matches!(self, Self::ItoM | Self::StoM | Self::OtoM)
    }

    /// Returns whether this transient state is a pure writeback (draining toward Invalid).
    #[must_use]
    pub const fn is_writeback(self) -> bool {
        matches!(self, Self::StoI | Self::MtoI | Self::EtoI | Self::OtoI | Self::ItoI)
    }
}

/// A single in-flight transaction record.
#[derive(Clone, Debug)]
pub struct MshrEntry {
    /// The transient state this transaction is in.
    pub state: TransientState,
    /// Scratch line buffer: holds the line's data while no stable `CacheLine` exists for
    /// it (either being assembled on a fetch, or drained out on a writeback).
    pub scratch: Box<[u8; LINE_BYTES]>,
    /// Number of `InvAck`s required before this transaction may complete, once known.
    pub need_invalid_ack: Option<u32>,
    /// Number of `InvAck`s received so far.
    pub invalid_ack: u32,
    /// Whether the data payload for this transaction has arrived.
    pub data_received: bool,
    /// Tick at which this MSHR was allocated, for latency stats.
    pub start_tick: u64,
}

impl MshrEntry {
    /// Allocates a fresh MSHR entry in the given transient state.
    #[must_use]
    pub fn new(state: TransientState, start_tick: u64) -> Self {
        Self {
            state,
            scratch: Box::new([0u8; LINE_BYTES]),
            need_invalid_ack: None,
            invalid_ack: 0,
            data_received: false,
            start_tick,
        }
    }

    /// Returns whether this transaction has collected everything it is waiting for: the
    /// data payload (if any is expected) and the full complement of invalidation acks.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let acks_done = match self.need_invalid_ack {
            Some(n) => self.invalid_ack >= n,
            None => true,
        };
        acks_done && (self.data_received || self.state.is_writeback())
    }

    /// Builds a resident `CacheLine` from this entry's scratch buffer in the given final
    /// stable state, consuming the entry.
    #[must_use]
    pub fn into_line(self, final_state: crate::line::MoesiState) -> CacheLine {
        CacheLine::new(final_state, self.scratch)
    }
}

/// The set of in-flight MSHRs an L1 (or the DMA engine) currently holds, bounded by a
/// fixed capacity.
#[derive(Debug, Default)]
pub struct MshrTable {
    entries: HashMap<LineIndex, MshrEntry>,
    capacity: usize,
}

impl MshrTable {
    /// Creates an empty table with room for `capacity` concurrent transactions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Attempts to allocate a fresh MSHR for `line` in `state`. Returns `None` (and performs
    /// no allocation) if the table is already at capacity.
    ///
    /// # Panics
    ///
    /// Panics via [`crate::protocol_violation`] if an MSHR for `line` already exists — the
    /// caller must check [`Self::get`] first.
    pub fn alloc(&mut self, line: LineIndex, state: TransientState, tick: u64) -> Option<&mut MshrEntry> {
        if self.entries.contains_key(&line) {
            crate::protocol_violation!("MSHR already exists for line {line:?}, at most one per line");
        }
        if self.entries.len() >= self.capacity {
            return None;
        }
        Some(self.entries.entry(line).or_insert_with(|| MshrEntry::new(state, tick)))
    }

    /// Returns a reference to the MSHR for `line`, if one exists.
    #[must_use]
    pub fn get(&self, line: LineIndex) -> Option<&MshrEntry> {
        self.entries.get(&line)
    }

    /// Returns a mutable reference to the MSHR for `line`, if one exists.
    #[must_use]
    pub fn get_mut(&mut self, line: LineIndex) -> Option<&mut MshrEntry> {
        self.entries.get_mut(&line)
    }

    /// Removes and returns the MSHR for `line`, completing its transaction.
    pub fn free(&mut self, line: LineIndex) -> Option<MshrEntry> {
        self.entries.remove(&line)
    }

    /// Returns whether the table has no free slots.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Returns the number of in-flight transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether there are no in-flight transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_capacity() {
        let mut t = MshrTable::new(1);
        assert!(t.alloc(LineIndex::new(0), TransientState::ItoS, 0).is_some());
        assert!(t.alloc(LineIndex::new(1), TransientState::ItoS, 0).is_none());
    }

    #[test]
    #[should_panic(expected = "at most one per line")]
    fn double_alloc_on_same_line_panics() {
        let mut t = MshrTable::new(4);
        t.alloc(LineIndex::new(5), TransientState::ItoM, 0);
        t.alloc(LineIndex::new(5), TransientState::ItoM, 0);
    }

    #[test]
    fn invalidate_coalescing_matches_transition_table() {
        assert_eq!(TransientState::StoI.coalesce_on_invalidate(), TransientState::ItoI);
        assert_eq!(TransientState::MtoI.coalesce_on_invalidate(), TransientState::ItoI);
        assert_eq!(TransientState::OtoM.coalesce_on_invalidate(), TransientState::ItoM);
        assert_eq!(TransientState::StoM.coalesce_on_invalidate(), TransientState::ItoM);
        assert_eq!(TransientState::ItoM.coalesce_on_invalidate(), TransientState::ItoM);
    }

    #[test]
    fn completion_requires_data_and_full_ack_count() {
        let mut e = MshrEntry::new(TransientState::ItoM, 0);
        e.need_invalid_ack = Some(2);
        assert!(!e.is_complete());
        e.invalid_ack = 2;
        assert!(!e.is_complete(), "data not yet received");
        e.data_received = true;
        assert!(e.is_complete());
    }

    #[test]
    fn writeback_entries_complete_without_data() {
        let mut e = MshrEntry::new(TransientState::MtoI, 0);
        assert!(e.is_complete());
        e.need_invalid_ack = Some(1);
        assert!(!e.is_complete());
    }
}

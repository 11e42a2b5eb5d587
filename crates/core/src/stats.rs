//! Aggregate simulation statistics.

use std::fmt;

/// Coherence-subsystem counters gathered across the whole run.
///
/// Every component increments its own fields directly; `Simulator::gather_stats` simply
/// hands back the accumulated totals at the end of the run.
#[derive(Debug, Default, Clone)]
pub struct SimStats {
    /// L1 access counters, one entry per requester index.
    pub l1: Vec<L1Stats>,
    /// LLC counters, one entry per NUCA slice.
    pub llc: Vec<LlcStats>,
    /// Memory node counters, one entry per node.
    pub memory: Vec<MemStats>,
    /// DMA engine counters.
    pub dma: DmaStats,
    /// Number of ticks the simulator ran.
    pub ticks: u64,
}

/// Per-L1 access counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct L1Stats {
    /// Hits serviced directly from the resident block array.
    pub hits: u64,
    /// Misses that allocated a fresh MSHR.
    pub misses: u64,
    /// Requests that returned `Busy` (structural stall).
    pub busy_stalls: u64,
    /// Lines evicted to make room for an incoming install.
    pub evictions: u64,
    /// Reservations invalidated before a matching `store_conditional`.
    pub reservations_lost: u64,
    /// Successful `store_conditional` operations.
    pub sc_success: u64,
    /// Failed (`Unconditional`) `store_conditional` operations.
    pub sc_failure: u64,
}

/// Per-LLC-slice counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlcStats {
    /// `GetS`/`GetM` requests served directly from the resident block array.
    pub hits: u64,
    /// `GetS`/`GetM` requests that required a fetch from memory.
    pub misses: u64,
    /// Requests satisfied by forwarding to a current owner/sharer.
    pub forwards: u64,
    /// Invalidations sent to sharers.
    pub invalidations_sent: u64,
    /// Lines evicted from the LLC block array.
    pub evictions: u64,
}

/// Per-memory-node counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemStats {
    /// Completed read transactions (`GetRespMem` emitted).
    pub reads: u64,
    /// Completed write transactions (`PutM`/`PutO` retired).
    pub writes: u64,
}

/// DMA engine counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaStats {
    /// Number of top-level `DMARequestUnit`s whose callback has fired.
    pub requests_completed: u64,
    /// Number of per-line `DMAProcessingUnit`s processed.
    pub units_processed: u64,
    /// Number of units deferred at least once due to MSHR backpressure.
    pub units_deferred: u64,
}

impl SimStats {
    /// Allocates zeroed stats for a system with `num_l1`, `num_llc_slices`, and
    /// `num_mem_nodes` components.
    #[must_use]
    pub fn new(num_l1: usize, num_llc_slices: usize, num_mem_nodes: usize) -> Self {
        Self {
            l1: vec![L1Stats::default(); num_l1],
            llc: vec![LlcStats::default(); num_llc_slices],
            memory: vec![MemStats::default(); num_mem_nodes],
            dma: DmaStats::default(),
            ticks: 0,
        }
    }

    /// Total L1 misses across all cores.
    #[must_use]
    pub fn total_l1_misses(&self) -> u64 {
        self.l1.iter().map(|s| s.misses).sum()
    }

    /// Total LLC misses across all slices.
    #[must_use]
    pub fn total_llc_misses(&self) -> u64 {
        self.llc.iter().map(|s| s.misses).sum()
    }

    /// Pretty-prints a multi-section human-readable report, one section per component kind.
    pub fn print_sections(&self) {
        println!("{self}");
    }
}

impl fmt::Display for SimStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Simulation stats ({} ticks) ===", self.ticks)?;
        writeln!(f, "-- L1 --")?;
        for (i, s) in self.l1.iter().enumerate() {
            writeln!(
                f,
                "  core {i}: hits={} misses={} busy={} evictions={} sc={}/{}",
                s.hits,
                s.misses,
                s.busy_stalls,
                s.evictions,
                s.sc_success,
                s.sc_success + s.sc_failure
            )?;
        }
        writeln!(f, "-- LLC --")?;
        for (i, s) in self.llc.iter().enumerate() {
            writeln!(
                f,
                "  slice {i}: hits={} misses={} forwards={} invalidations={} evictions={}",
                s.hits, s.misses, s.forwards, s.invalidations_sent, s.evictions
            )?;
        }
        writeln!(f, "-- Memory --")?;
        for (i, s) in self.memory.iter().enumerate() {
            writeln!(f, "  node {i}: reads={} writes={}", s.reads, s.writes)?;
        }
        writeln!(
            f,
            "-- DMA -- requests={} units={} deferred={}",
            self.dma.requests_completed, self.dma.units_processed, self.dma.units_deferred
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_across_components() {
        let mut s = SimStats::new(2, 1, 1);
        s.l1[0].misses = 3;
        s.l1[1].misses = 4;
        s.llc[0].misses = 5;
        assert_eq!(s.total_l1_misses(), 7);
        assert_eq!(s.total_llc_misses(), 5);
    }
}

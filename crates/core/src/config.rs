//! Configuration for the coherence simulator.
//!
//! This module defines all configuration structures used to parameterize the L1, LLC,
//! memory node, and DMA components. It provides:
//! 1. **Defaults:** baseline hardware constants (MSHR counts, latencies, line counts).
//! 2. **Structures:** hierarchical config for the bus, L1, LLC, memory, and DMA.
//!
//! Configuration is supplied as JSON (`Config::from_json`) or via `Config::default()`.

use serde::Deserialize;

/// Default configuration constants.
mod defaults {
    /// Number of MSHR entries per L1 controller.
    pub const L1_MSHR_COUNT: usize = 16;
    /// Number of resident lines an L1 block array holds before it must evict.
    pub const L1_CAPACITY_LINES: usize = 256;
    /// Outbound send-buffer depth per L1 (structural resource per `spec.md` §4.2).
    pub const L1_SEND_BUF: usize = 4;

    /// Number of in-flight transactions (`process_buf`) the LLC pipeline admits at once;
    /// doubles as the LLC's per-line exclusion table size.
    pub const LLC_MSHR_COUNT: usize = 32;
    /// Number of resident lines the LLC block array holds per slice.
    pub const LLC_CAPACITY_LINES: usize = 1024;
    /// Simulated index-stage latency in cycles (`spec.md` §4.3 "index" stage).
    pub const LLC_INDEX_LATENCY: u64 = 4;
    /// Number of LLC directory slices (NUCA sharding, `spec.md` §4.3 "NUCA sharding").
    pub const LLC_NUCA_SLICES: u64 = 1;

    /// Bytes transferred per tick by a memory node (`spec.md` §4.4 `dwidth`).
    pub const MEM_DWIDTH: usize = 8;
    /// In-flight memory-access buffer depth.
    pub const MEM_ACCESS_BUF: usize = 4;

    /// Per-hop bus latency in cycles, applied to every message regardless of channel.
    pub const BUS_LATENCY: u64 = 2;

    /// Number of in-flight DMA line-units the engine tracks via MSHRs.
    pub const DMA_MSHR_COUNT: usize = 32;
}

/// Root configuration structure for the coherence subsystem.
///
/// # Examples
///
/// ```
/// use moesi_sim_core::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.l1.mshr_count, 16);
/// assert_eq!(config.llc.nuca_slices, 1);
/// ```
///
/// Deserializing from JSON:
///
/// ```
/// use moesi_sim_core::config::Config;
///
/// let json = r#"{
///     "general": { "trace_instructions": true },
///     "bus": { "latency_cycles": 3 },
///     "l1": { "mshr_count": 8, "capacity_lines": 64, "send_buf_depth": 4 },
///     "llc": { "mshr_count": 16, "capacity_lines": 512, "index_latency": 2, "nuca_slices": 2 },
///     "memory": { "dwidth_bytes": 8, "access_buf_depth": 4 },
///     "dma": { "mshr_count": 16 }
/// }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.llc.nuca_slices, 2);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General simulation settings (tracing).
    pub general: GeneralConfig,
    /// Bus fabric parameters.
    pub bus: BusConfig,
    /// L1 private cache parameters.
    pub l1: L1Config,
    /// LLC + directory parameters.
    pub llc: LlcConfig,
    /// Memory node parameters.
    pub memory: MemoryConfig,
    /// DMA engine parameters.
    pub dma: DmaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            bus: BusConfig::default(),
            l1: L1Config::default(),
            llc: LlcConfig::default(),
            memory: MemoryConfig::default(),
            dma: DmaConfig::default(),
        }
    }
}

impl Config {
    /// Parses a `Config` from a JSON string, falling back to per-field defaults for any
    /// key that is absent.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if `json` is not valid JSON or has a field of the
    /// wrong type.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// General simulation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable per-transaction tracing via `CacheEventTrace` and `tracing` events.
    pub trace_instructions: bool,
    /// Assign non-zero transaction IDs to coherence messages (off by default, per
    /// `spec.md` §6's "optional, zero if tracing off").
    pub transaction_ids: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            trace_instructions: false,
            transaction_ids: true,
        }
    }
}

/// Bus fabric configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-hop latency in cycles applied to every message on every channel.
    pub latency_cycles: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            latency_cycles: defaults::BUS_LATENCY,
        }
    }
}

/// L1 private cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Number of MSHR entries (at most one per in-flight line, `spec.md` §3).
    pub mshr_count: usize,
    /// Number of resident lines before LRU eviction kicks in.
    pub capacity_lines: usize,
    /// Outbound send-buffer depth.
    pub send_buf_depth: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            mshr_count: defaults::L1_MSHR_COUNT,
            capacity_lines: defaults::L1_CAPACITY_LINES,
            send_buf_depth: defaults::L1_SEND_BUF,
        }
    }
}

/// LLC + directory configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlcConfig {
    /// Number of in-flight (pinned) lines the three-stage pipeline admits at once.
    pub mshr_count: usize,
    /// Number of resident lines per NUCA slice before LRU eviction.
    pub capacity_lines: usize,
    /// Simulated index-stage latency in cycles.
    pub index_latency: u64,
    /// Number of NUCA directory slices; line `L` belongs to slice `L % nuca_slices`.
    pub nuca_slices: u64,
}

impl Default for LlcConfig {
    fn default() -> Self {
        Self {
            mshr_count: defaults::LLC_MSHR_COUNT,
            capacity_lines: defaults::LLC_CAPACITY_LINES,
            index_latency: defaults::LLC_INDEX_LATENCY,
            nuca_slices: defaults::LLC_NUCA_SLICES,
        }
    }
}

/// Memory node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes transferred per tick between the memory node and its host-backed byte array.
    pub dwidth_bytes: usize,
    /// In-flight memory-access buffer depth.
    pub access_buf_depth: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dwidth_bytes: defaults::MEM_DWIDTH,
            access_buf_depth: defaults::MEM_ACCESS_BUF,
        }
    }
}

/// DMA engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DmaConfig {
    /// Number of in-flight line-units the engine tracks via MSHRs.
    pub mshr_count: usize,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            mshr_count: defaults::DMA_MSHR_COUNT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let c = Config::default();
        assert_eq!(c.l1.mshr_count, 16);
        assert_eq!(c.llc.nuca_slices, 1);
        assert!(!c.general.trace_instructions);
    }

    #[test]
    fn partial_json_fills_remaining_fields_from_defaults() {
        let json = r#"{ "llc": { "nuca_slices": 4 } }"#;
        let c = Config::from_json(json).unwrap();
        assert_eq!(c.llc.nuca_slices, 4);
        assert_eq!(c.llc.mshr_count, defaults::LLC_MSHR_COUNT);
        assert_eq!(c.l1.mshr_count, defaults::L1_MSHR_COUNT);
    }
}

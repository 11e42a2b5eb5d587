//! End-to-end test entry point for the coherence subsystem.
//!
//! This module is the sole auto-discovered integration test binary for this crate; it
//! declares the scenario suite as a child module so everything below compiles as one
//! target instead of one-file-per-scenario.

/// Concrete end-to-end scenarios driving a full [`Simulator`](moesi_sim_core::Simulator)
/// through multiple cores, the LLC, memory nodes and the DMA engine.
mod scenarios;

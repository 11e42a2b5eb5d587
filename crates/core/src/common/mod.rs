//! Common types shared across the coherence subsystem.
//!
//! This module provides:
//! 1. **Addressing:** `LineIndex`/`PhysAddr` strong types and the line-offset math used
//!    everywhere a physical address must be split into a cache line and a byte offset.
//! 2. **Errors:** the outward-visible `AccessOutcome` enum and the `protocol_violation!()`
//!    macro used for invariant violations that can never be retried.

/// Physical addressing and line-index conversion.
pub mod addr;
/// Outward-visible access outcomes and fatal protocol-violation handling.
pub mod error;

pub use addr::{LineIndex, PhysAddr};
pub use error::{AccessOutcome, ProtocolError};

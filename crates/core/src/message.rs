//! Coherence message types and the bit-exact wire codec.
//!
//! `CoherenceMsg` is the only thing that ever crosses a [`crate::bus::Bus`] port. It is
//! constructed once at its origin, travels the bus by value, and is consumed at its
//! destination — no component ever shares a pointer into another component's state.
//!
//! The wire layout below is bit-exact so that two independent implementations exchanging
//! packets over the same bus image stay interoperable:
//!
//! | Field | Width | Notes |
//! |-------|-------|-------|
//! | type  | 8 bits | [`MsgType`] discriminant |
//! | channel | 2 bits | 0=REQ, 1=RESP, 2=ACK |
//! | line_index | 48 bits | |
//! | arg | 32 bits | source port or sharer count, type-dependent |
//! | transaction_id | 32 bits | optional, zero if tracing off |
//! | data | 0 or `LINE_BYTES` | present only when `type` carries data |

use crate::common::addr::LINE_BYTES;
use crate::common::LineIndex;

/// The 16 coherence message kinds, forming a single logical namespace shared by the L1,
/// LLC, memory node, and DMA engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Home (or a forwarding owner) tells a sharer to drop its copy.
    Invalidate = 0,
    /// Acknowledges a completed `Invalidate`.
    InvAck = 1,
    /// L1 request for read (shared) permission.
    GetS = 2,
    /// L1 request for write (modified) permission.
    GetM = 3,
    /// Home asks a current holder to supply data for a `GetS` on behalf of a requester.
    GetSForward = 4,
    /// Home asks the current owner to supply data for a `GetM` on behalf of a requester.
    GetMForward = 5,
    /// Data response to a `GetS`, carries the line.
    GetSResp = 6,
    /// Data response to a `GetM`, carries the line.
    GetMResp = 7,
    /// Home tells the requester how many `InvAck`s to expect before a `GetM` completes.
    GetMAck = 8,
    /// Requester tells home the transaction is complete (data installed).
    GetAck = 9,
    /// Memory node's data response to a `GetSForward`/`GetMForward`.
    GetRespMem = 10,
    /// Writeback of a line held in S, permission-only (no data).
    PutS = 11,
    /// Writeback of a line held in E, permission-only (no data).
    PutE = 12,
    /// Writeback of a line held in M, carries data.
    PutM = 13,
    /// Writeback of a line held in O, carries data.
    PutO = 14,
    /// Acknowledges a completed Put.
    PutAck = 15,
}

impl MsgType {
    /// Returns whether this message type carries a cache-line payload.
    #[must_use]
    pub const fn carries_data(self) -> bool {
        matches!(
            self,
            Self::GetSResp | Self::GetMResp | Self::GetRespMem | Self::PutM | Self::PutO
        )
    }

    /// Returns the channel this message type is required to travel on.
    ///
    /// Per `spec.md` §3: REQ carries requests toward home; RESP carries data/acks back to
    /// the requester *and* forwards (a home asking a sharer/owner to supply data directly);
    /// ACK is the low-priority channel for invalidations and completion acks.
    #[must_use]
    pub const fn channel(self) -> Channel {
        match self {
            Self::GetS | Self::GetM | Self::PutS | Self::PutE | Self::PutM | Self::PutO => {
                Channel::Req
            }
            Self::GetSForward
            | Self::GetMForward
            | Self::GetSResp
            | Self::GetMResp
            | Self::GetMAck
            | Self::GetRespMem => Channel::Resp,
            Self::Invalidate | Self::InvAck | Self::GetAck | Self::PutAck => Channel::Ack,
        }
    }

    /// Decodes a wire discriminant back into a `MsgType`.
    ///
    /// # Panics
    ///
    /// Panics via [`crate::protocol_violation`] if `v` is not one of the 16 defined kinds;
    /// an undecodable type on the wire is a protocol bug, not a recoverable error.
    #[must_use]
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => Self::Invalidate,
            1 => Self::InvAck,
            2 => Self::GetS,
            3 => Self::GetM,
            4 => Self::GetSForward,
            5 => Self::GetMForward,
            6 => Self::GetSResp,
            7 => Self::GetMResp,
            8 => Self::GetMAck,
            9 => Self::GetAck,
            10 => Self::GetRespMem,
            11 => Self::PutS,
            12 => Self::PutE,
            13 => Self::PutM,
            14 => Self::PutO,
            15 => Self::PutAck,
            other => crate::protocol_violation!("unknown wire MsgType discriminant {other}"),
        }
    }
}

/// One of the three deadlock-avoidance channels a message is partitioned onto.
///
/// Each [`MsgType`] lives on exactly one channel (see [`MsgType::channel`]); the bus
/// guarantees per-channel, per-endpoint FIFO delivery, but gives no ordering guarantee
/// across channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Requests traveling toward a home node.
    Req = 0,
    /// Data and forwards traveling back toward a requester.
    Resp = 1,
    /// Low-priority acknowledgements.
    Ack = 2,
}

impl Channel {
    /// Decodes a wire channel discriminant.
    ///
    /// # Panics
    ///
    /// Panics via [`crate::protocol_violation`] if `v` is not `0`, `1`, or `2`.
    #[must_use]
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => Self::Req,
            1 => Self::Resp,
            2 => Self::Ack,
            other => crate::protocol_violation!("unknown wire Channel discriminant {other}"),
        }
    }
}

/// A coherence message, owned end-to-end: data-carrying variants embed the line payload by
/// value, never by reference, so a message handed to the bus can outlive its sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoherenceMsg {
    /// The message kind.
    pub msg_type: MsgType,
    /// The line this message concerns.
    pub line_index: LineIndex,
    /// Message-dependent argument: a source port for forwards, a sharer/ack count for
    /// `GetMAck`, or a byte count/mask-length for masked data messages.
    pub arg: u32,
    /// Correlates messages belonging to the same end-to-end transaction for tracing;
    /// zero when tracing is disabled.
    pub transaction_id: u32,
    /// The cache line payload, present only when `msg_type.carries_data()`.
    pub data: Option<Box<[u8; LINE_BYTES]>>,
}

impl CoherenceMsg {
    /// Builds a message with no data payload.
    #[must_use]
    pub fn new(msg_type: MsgType, line_index: LineIndex, arg: u32, transaction_id: u32) -> Self {
        debug_assert!(!msg_type.carries_data(), "this MsgType requires data");
        Self {
            msg_type,
            line_index,
            arg,
            transaction_id,
            data: None,
        }
    }

    /// Builds a message carrying a cache line payload.
    #[must_use]
    pub fn with_data(
        msg_type: MsgType,
        line_index: LineIndex,
        arg: u32,
        transaction_id: u32,
        data: Box<[u8; LINE_BYTES]>,
    ) -> Self {
        debug_assert!(msg_type.carries_data(), "this MsgType carries no data");
        Self {
            msg_type,
            line_index,
            arg,
            transaction_id,
            data: Some(data),
        }
    }

    /// Returns the channel this message travels on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.msg_type.channel()
    }

    /// Serializes this message to its bit-exact wire representation.
    #[must_use]
    pub fn construct(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 1 + 6 + 4 + 4 + LINE_BYTES);
        out.push(self.msg_type as u8);
        out.push(self.channel() as u8);
        // 48-bit line_index, big-endian.
        let li = self.line_index.val();
        out.extend_from_slice(&li.to_be_bytes()[2..8]);
        out.extend_from_slice(&self.arg.to_be_bytes());
        out.extend_from_slice(&self.transaction_id.to_be_bytes());
        if let Some(data) = &self.data {
            out.extend_from_slice(data.as_slice());
        }
        out
    }

    /// Deserializes a message from its wire representation.
    ///
    /// # Panics
    ///
    /// Panics via [`crate::protocol_violation`] if `bytes` is shorter than the fixed header,
    /// if the declared type doesn't carry data but the buffer has a trailing payload (or vice
    /// versa), or if the payload length is not exactly `LINE_BYTES`.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Self {
        const HEADER_LEN: usize = 1 + 1 + 6 + 4 + 4;
        if bytes.len() < HEADER_LEN {
            crate::protocol_violation!(
                "packet too short: {} bytes, need at least {HEADER_LEN}",
                bytes.len()
            );
        }
        let msg_type = MsgType::from_wire(bytes[0]);
        let _channel = Channel::from_wire(bytes[1]);

        let mut li_bytes = [0u8; 8];
        li_bytes[2..8].copy_from_slice(&bytes[2..8]);
        let line_index = LineIndex::new(u64::from_be_bytes(li_bytes));

        let arg = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let transaction_id = u32::from_be_bytes(bytes[12..16].try_into().unwrap());

        let payload = &bytes[HEADER_LEN..];
        let data = if msg_type.carries_data() {
            if payload.len() != LINE_BYTES {
                crate::protocol_violation!(
                    "{msg_type:?} must carry exactly {LINE_BYTES} data bytes, got {}",
                    payload.len()
                );
            }
            let mut buf = Box::new([0u8; LINE_BYTES]);
            buf.copy_from_slice(payload);
            Some(buf)
        } else {
            if !payload.is_empty() {
                crate::protocol_violation!("{msg_type:?} must not carry a data payload");
            }
            None
        };

        Self {
            msg_type,
            line_index,
            arg,
            transaction_id,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_line(seed: u8) -> Box<[u8; LINE_BYTES]> {
        let mut buf = Box::new([0u8; LINE_BYTES]);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        buf
    }

    #[test]
    fn round_trips_a_header_only_message() {
        let msg = CoherenceMsg::new(MsgType::GetS, LineIndex::new(0xABCDEF), 7, 42);
        let bytes = msg.construct();
        let back = CoherenceMsg::parse(&bytes);
        assert_eq!(msg, back);
    }

    #[test]
    fn round_trips_every_data_carrying_type() {
        for ty in [
            MsgType::GetSResp,
            MsgType::GetMResp,
            MsgType::GetRespMem,
            MsgType::PutM,
            MsgType::PutO,
        ] {
            let msg = CoherenceMsg::with_data(
                ty,
                LineIndex::new(123_456),
                9,
                1,
                sample_line(ty as u8),
            );
            let bytes = msg.construct();
            let back = CoherenceMsg::parse(&bytes);
            assert_eq!(msg, back, "round-trip failed for {ty:?}");
        }
    }

    #[test]
    fn line_index_truncates_to_48_bits_on_the_wire() {
        let msg = CoherenceMsg::new(MsgType::GetM, LineIndex::new(0x1_0000_0000_0000), 0, 0);
        let bytes = msg.construct();
        let back = CoherenceMsg::parse(&bytes);
        assert_eq!(back.line_index, LineIndex::new(0));
    }

    #[test]
    fn each_type_lives_on_exactly_one_channel() {
        assert_eq!(MsgType::GetS.channel(), Channel::Req);
        assert_eq!(MsgType::GetSResp.channel(), Channel::Resp);
        assert_eq!(MsgType::Invalidate.channel(), Channel::Ack);
        assert_eq!(MsgType::PutAck.channel(), Channel::Ack);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_header_only_round_trips(
                line in 0u64..(1u64 << 48),
                arg in any::<u32>(),
                txn in any::<u32>(),
            ) {
                let msg = CoherenceMsg::new(MsgType::GetS, LineIndex::new(line), arg, txn);
                let back = CoherenceMsg::parse(&msg.construct());
                prop_assert_eq!(msg, back);
            }
        }
    }
}

//! Backing memory node: a passive slave serving reads/writes on behalf of the LLC.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::bus::{Bus, BusPortMap, Port};
use crate::common::addr::LINE_BYTES;
use crate::common::LineIndex;
use crate::message::{Channel, CoherenceMsg, MsgType};
use crate::stats::MemStats;

/// Injected address-mapping interface so multiple memory nodes can shard backing storage
/// by line index (typically `line_index % node_count == node_index`).
pub trait MemCtrlLineAddrMap {
    /// Returns whether this node is responsible for `line`.
    fn is_responsible(&self, line: LineIndex) -> bool;
    /// Returns the byte offset into this node's local backing array for `line`.
    fn local_mem_offset(&self, line: LineIndex) -> usize;
}

enum AccessKind {
    Read { requester_idx: u32, transaction_id: u32 },
    Write,
}

struct PendingAccess {
    line: LineIndex,
    kind: AccessKind,
    buf: Box<[u8; LINE_BYTES]>,
    progress: usize,
}

/// A memory node: `dwidth` bytes of any in-flight access transfer per tick.
pub struct MemoryNode {
    port: Port,
    bus: Rc<RefCell<Bus>>,
    port_map: Rc<dyn BusPortMap>,
    addr_map: Rc<dyn MemCtrlLineAddrMap>,
    mem: Vec<u8>,
    dwidth: usize,
    access_buf_depth: usize,
    access_buf: VecDeque<PendingAccess>,
    pending_sends: Vec<(Port, CoherenceMsg)>,
    tick: u64,
    stats: MemStats,
}

impl MemoryNode {
    /// Builds a new memory node backed by `mem_size` bytes, all initially zero.
    #[must_use]
    pub fn new(
        port: Port,
        bus: Rc<RefCell<Bus>>,
        port_map: Rc<dyn BusPortMap>,
        addr_map: Rc<dyn MemCtrlLineAddrMap>,
        mem_size: usize,
        dwidth: usize,
        access_buf_depth: usize,
    ) -> Self {
        Self {
            port,
            bus,
            port_map,
            addr_map,
            mem: vec![0u8; mem_size],
            dwidth,
            access_buf_depth,
            access_buf: VecDeque::new(),
            pending_sends: Vec::new(),
            tick: 0,
            stats: MemStats::default(),
        }
    }

    /// Returns this node's bus port.
    #[must_use]
    pub fn port(&self) -> Port {
        self.port
    }

    /// Returns a snapshot of this node's statistics.
    #[must_use]
    pub fn stats(&self) -> MemStats {
        self.stats
    }

    /// Directly seeds `data` at `line`'s backing storage, bypassing the bus. Used to set up
    /// test fixtures and DMA source buffers that live in simulated memory from the start.
    ///
    /// # Panics
    ///
    /// Panics if `line` is not this node's responsibility.
    pub fn seed_line(&mut self, line: LineIndex, data: &[u8; LINE_BYTES]) {
        assert!(self.addr_map.is_responsible(line), "line not owned by this memory node");
        let offset = self.addr_map.local_mem_offset(line);
        self.mem[offset..offset + LINE_BYTES].copy_from_slice(data);
    }

    /// Directly reads back `line`'s backing storage, bypassing the bus. Used by tests and
    /// by DMA host-memory fast paths that address simulated memory's true contents.
    ///
    /// # Panics
    ///
    /// Panics if `line` is not this node's responsibility.
    #[must_use]
    pub fn read_line(&self, line: LineIndex) -> [u8; LINE_BYTES] {
        assert!(self.addr_map.is_responsible(line), "line not owned by this memory node");
        let offset = self.addr_map.local_mem_offset(line);
        let mut out = [0u8; LINE_BYTES];
        out.copy_from_slice(&self.mem[offset..offset + LINE_BYTES]);
        out
    }

    /// Phase 1: advance in-flight transfers by `dwidth` bytes and admit one new request.
    pub fn on_current_tick(&mut self) {
        self.advance();
        self.fetch();
    }

    /// Phase 2: flush staged outbound messages, retrying any that don't fit this tick.
    pub fn apply_next_tick(&mut self) {
        let mut remaining = Vec::with_capacity(self.pending_sends.len());
        for (to, msg) in self.pending_sends.drain(..) {
            let sent = self.bus.borrow_mut().send(self.port, to, msg.clone());
            if !sent {
                remaining.push((to, msg));
            }
        }
        self.pending_sends = remaining;
        self.tick += 1;
    }

    fn fetch(&mut self) {
        if self.access_buf.len() >= self.access_buf_depth {
            return;
        }
        for channel in [Channel::Req, Channel::Resp] {
            let Some(msg) = self.bus.borrow().peek(self.port, channel) else {
                continue;
            };
            let line = msg.line_index;
            if !self.addr_map.is_responsible(line) {
                crate::protocol_violation!("memory node received line {line:?} it is not responsible for");
            }
            let msg_type = msg.msg_type;
            let (_from, msg) = self.bus.borrow_mut().recv(self.port, channel).expect("peeked");
            let access = match msg_type {
                MsgType::GetSForward | MsgType::GetMForward => {
                    let offset = self.addr_map.local_mem_offset(line);
                    let mut buf = Box::new([0u8; LINE_BYTES]);
                    buf.copy_from_slice(&self.mem[offset..offset + LINE_BYTES]);
                    PendingAccess {
                        line,
                        kind: AccessKind::Read {
                            requester_idx: msg.arg,
                            transaction_id: msg.transaction_id,
                        },
                        buf,
                        progress: 0,
                    }
                }
                MsgType::PutM | MsgType::PutO => PendingAccess {
                    line,
                    kind: AccessKind::Write,
                    buf: msg.data.clone().expect("PutM/PutO carries data"),
                    progress: 0,
                },
                other => crate::protocol_violation!("memory node received unexpected {other:?}"),
            };
            self.access_buf.push_back(access);
            return;
        }
    }

    fn advance(&mut self) {
        let mut finished = Vec::new();
        for (i, access) in self.access_buf.iter_mut().enumerate() {
            access.progress = (access.progress + self.dwidth).min(LINE_BYTES);
            if access.progress >= LINE_BYTES {
                finished.push(i);
            }
        }
        for &i in finished.iter().rev() {
            let access = self.access_buf.remove(i).expect("index just collected");
            match access.kind {
                AccessKind::Read { requester_idx, transaction_id } => {
                    let requester_port = self.port_map.requester_port(requester_idx);
                    let resp = CoherenceMsg::with_data(MsgType::GetRespMem, access.line, 0, transaction_id, access.buf);
                    self.pending_sends.push((requester_port, resp));
                    self.stats.reads += 1;
                }
                AccessKind::Write => {
                    let offset = self.addr_map.local_mem_offset(access.line);
                    self.mem[offset..offset + LINE_BYTES].copy_from_slice(access.buf.as_slice());
                    self.stats.writes += 1;
                }
            }
        }
    }
}

/// A straightforward modulo-sharded address map: `node_count` nodes, each backing
/// `lines_per_node` contiguous lines' worth of bytes.
pub struct ModuloLineMap {
    node_index: u64,
    node_count: u64,
}

impl ModuloLineMap {
    /// Builds a map for node `node_index` of `node_count` total nodes.
    #[must_use]
    pub fn new(node_index: u64, node_count: u64) -> Self {
        Self { node_index, node_count }
    }
}

impl MemCtrlLineAddrMap for ModuloLineMap {
    fn is_responsible(&self, line: LineIndex) -> bool {
        line.val() % self.node_count == self.node_index
    }

    fn local_mem_offset(&self, line: LineIndex) -> usize {
        let local_line = line.val() / self.node_count;
        (local_line as usize) * LINE_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct FlatMap(StdHashMap<u32, Port>);
    impl BusPortMap for FlatMap {
        fn home_node_port(&self, _line: LineIndex) -> Port {
            Port(100)
        }
        fn sub_node_port(&self, _line: LineIndex) -> Port {
            Port(200)
        }
        fn requester_port(&self, index: u32) -> Port {
            self.0[&index]
        }
        fn requester_index(&self, port: Port) -> u32 {
            port.0
        }
    }

    #[test]
    fn modulo_map_shards_by_line_index() {
        let map = ModuloLineMap::new(1, 2);
        assert!(map.is_responsible(LineIndex::new(1)));
        assert!(!map.is_responsible(LineIndex::new(2)));
        assert_eq!(map.local_mem_offset(LineIndex::new(3)), LINE_BYTES);
    }

    #[test]
    fn read_completes_after_dwidth_limited_ticks() {
        let bus = Rc::new(RefCell::new(Bus::new(0, 8)));
        let mut requesters = StdHashMap::new();
        requesters.insert(0u32, Port(0));
        let port_map: Rc<dyn BusPortMap> = Rc::new(FlatMap(requesters));
        let addr_map: Rc<dyn MemCtrlLineAddrMap> = Rc::new(ModuloLineMap::new(0, 1));
        let mut node = MemoryNode::new(Port(200), Rc::clone(&bus), port_map, addr_map, 4096, 16, 4);

        let line = LineIndex::new(0);
        node.seed_line(line, &[42u8; LINE_BYTES]);
        let fwd = CoherenceMsg::new(MsgType::GetSForward, line, 0, 0);
        bus.borrow_mut().send(Port(0), Port(200), fwd);

        // LINE_BYTES(64)/dwidth(16) = 4 ticks to complete the transfer.
        for _ in 0..4 {
            node.on_current_tick();
            node.apply_next_tick();
            bus.borrow_mut().advance_tick();
        }
        let (_from, resp) = bus.borrow_mut().recv(Port(0), Channel::Resp).expect("response ready");
        assert_eq!(resp.msg_type, MsgType::GetRespMem);
        assert_eq!(resp.data.unwrap()[0], 42);
    }
}

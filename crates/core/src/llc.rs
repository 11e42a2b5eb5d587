//! The shared, sharded last-level cache and its coherence directory.
//!
//! Unlike the L1, the LLC exposes no synchronous caller interface — it is driven entirely
//! by incoming bus messages, through a three-stage pipeline: fetch (pop one message,
//! respecting per-line exclusion), index (a simulated lookup latency), and process
//! (compose outgoing messages and writebacks).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::bus::{Bus, BusPortMap, Port};
use crate::common::LineIndex;
use crate::line::{CacheLine, MoesiState};
use crate::lru::LruStore;
use crate::message::{Channel, CoherenceMsg, MsgType};
use crate::stats::LlcStats;
use crate::trace::{CacheEventTrace, TraceEvent};

/// The LLC-side directory entry for one cached line.
#[derive(Clone, Debug, Default)]
struct DirEntry {
    sharers: HashSet<u32>,
    owner: Option<u32>,
    dirty: bool,
}

struct Staged {
    ready_tick: u64,
    from_idx: u32,
    msg: CoherenceMsg,
}

/// One shard of the last-level cache. If the system uses `N` NUCA slices, this instance is
/// responsible for every line `L` with `L % N == nuca_index`.
pub struct Llc {
    nuca_index: u64,
    nuca_count: u64,
    port: Port,
    bus: Rc<RefCell<Bus>>,
    port_map: Rc<dyn BusPortMap>,
    trace: Option<Rc<RefCell<CacheEventTrace>>>,
    blocks: LruStore<CacheLine>,
    directory: HashMap<LineIndex, DirEntry>,
    pinned: HashSet<LineIndex>,
    index_latency: u64,
    staged: VecDeque<Staged>,
    pending_sends: Vec<(Port, CoherenceMsg)>,
    tick: u64,
    stats: LlcStats,
}

impl Llc {
    /// Builds a new LLC slice.
    #[must_use]
    pub fn new(
        nuca_index: u64,
        nuca_count: u64,
        port: Port,
        bus: Rc<RefCell<Bus>>,
        port_map: Rc<dyn BusPortMap>,
        capacity_lines: usize,
        index_latency: u64,
    ) -> Self {
        Self {
            nuca_index,
            nuca_count,
            port,
            bus,
            port_map,
            trace: None,
            blocks: LruStore::new(capacity_lines),
            directory: HashMap::new(),
            pinned: HashSet::new(),
            index_latency,
            staged: VecDeque::new(),
            pending_sends: Vec::new(),
            tick: 0,
            stats: LlcStats::default(),
        }
    }

    /// Attaches an event trace collector.
    pub fn attach_trace(&mut self, trace: Rc<RefCell<CacheEventTrace>>) {
        self.trace = Some(trace);
    }

    /// Returns this slice's bus port.
    #[must_use]
    pub fn port(&self) -> Port {
        self.port
    }

    /// Returns a snapshot of this slice's statistics.
    #[must_use]
    pub fn stats(&self) -> LlcStats {
        self.stats
    }

    fn owns(&self, line: LineIndex) -> bool {
        line.val() % self.nuca_count == self.nuca_index
    }

    /// Phase 1: fetch at most one new request into the pipeline (respecting per-line
    /// exclusion) and finish at most one request whose index-stage latency has elapsed.
    pub fn on_current_tick(&mut self) {
        self.fetch();
        self.process_ready();
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
        // GetAck is the only message type the LLC ever receives on ACK; prioritize it so
        // pins are released before new transactions are admitted.
        if let Some(msg) = self.bus.borrow().peek(self.port, Channel::Ack) {
            if msg.msg_type == MsgType::GetAck {
                let line = msg.line_index;
                let (from, msg) = self.bus.borrow_mut().recv(self.port, Channel::Ack).expect("peeked");
                self.assert_owned(line);
                self.pinned.remove(&line);
                if let Some(trace) = &self.trace {
                    let requester = self.port_map.requester_index(from);
                    trace.borrow_mut().record(requester, line, TraceEvent::L2Finish, self.tick);
                }
                let _ = msg;
                return;
            }
        }
        if let Some(msg) = self.bus.borrow().peek(self.port, Channel::Req) {
            if self.pinned.contains(&msg.line_index) {
                return;
            }
            let line = msg.line_index;
            let (from, msg) = self.bus.borrow_mut().recv(self.port, Channel::Req).expect("peeked");
            self.assert_owned(line);
            self.pinned.insert(line);
            let from_idx = self.port_map.requester_index(from);
            self.staged.push_back(Staged {
                ready_tick: self.tick + self.index_latency,
                from_idx,
                msg,
            });
        }
    }

    fn process_ready(&mut self) {
        let ready = self.staged.front().is_some_and(|s| s.ready_tick <= self.tick);
        if !ready {
            return;
        }
        let Staged { from_idx, msg, .. } = self.staged.pop_front().expect("checked ready above");
        let line = msg.line_index;
        match msg.msg_type {
            MsgType::GetS => self.handle_gets(from_idx, &msg),
            MsgType::GetM => self.handle_getm(from_idx, &msg),
            MsgType::PutS | MsgType::PutE => {
                self.handle_put_permission_only(from_idx, &msg);
                self.pinned.remove(&line);
            }
            MsgType::PutM | MsgType::PutO => {
                self.handle_put_with_data(from_idx, &msg);
                self.pinned.remove(&line);
            }
            other => crate::protocol_violation!("LLC received unexpected {other:?} in REQ pipeline"),
        }
    }

    fn assert_owned(&self, line: LineIndex) {
        if !self.owns(line) {
            crate::protocol_violation!(
                "LLC slice {} received line {line:?} belonging to slice {}",
                self.nuca_index,
                line.val() % self.nuca_count
            );
        }
    }

    fn handle_gets(&mut self, from_idx: u32, msg: &CoherenceMsg) {
        let line = msg.line_index;
        if let Some(dir) = self.directory.get(&line).cloned() {
            let owner = dir.owner.unwrap_or_else(|| crate::protocol_violation!("directory entry for {line:?} has no owner"));
            let owner_port = self.port_map.requester_port(owner);
            let fwd = CoherenceMsg::new(MsgType::GetSForward, line, from_idx, msg.transaction_id);
            self.pending_sends.push((owner_port, fwd));
            self.directory.get_mut(&line).expect("just read").sharers.insert(from_idx);
            self.stats.forwards += 1;
            if let Some(trace) = &self.trace {
                trace.borrow_mut().record(from_idx, line, TraceEvent::L2Forward, self.tick);
            }
            return;
        }
        if let Some(block) = self.blocks.remove(line) {
            let requester_port = self.port_map.requester_port(from_idx);
            let resp = CoherenceMsg::with_data(MsgType::GetSResp, line, 0, msg.transaction_id, block.data);
            self.pending_sends.push((requester_port, resp));
            self.stats.hits += 1;
            if let Some(trace) = &self.trace {
                trace.borrow_mut().record(from_idx, line, TraceEvent::L2Hit, self.tick);
            }
        } else {
            let sub = self.port_map.sub_node_port(line);
            let fwd = CoherenceMsg::new(MsgType::GetSForward, line, from_idx, msg.transaction_id);
            self.pending_sends.push((sub, fwd));
            self.stats.misses += 1;
            if let Some(trace) = &self.trace {
                trace.borrow_mut().record(from_idx, line, TraceEvent::L2Miss, self.tick);
            }
        }
        self.directory.insert(
            line,
            DirEntry {
                sharers: HashSet::from([from_idx]),
                owner: Some(from_idx),
                dirty: true,
            },
        );
    }

    fn handle_getm(&mut self, from_idx: u32, msg: &CoherenceMsg) {
        let line = msg.line_index;
        if let Some(dir) = self.directory.get(&line).cloned() {
            let mut ack_count = 0u32;
            for &sharer in &dir.sharers {
                if sharer == from_idx || dir.owner == Some(sharer) {
                    continue;
                }
                let sharer_port = self.port_map.requester_port(sharer);
                let inv = CoherenceMsg::new(MsgType::Invalidate, line, from_idx, msg.transaction_id);
                self.pending_sends.push((sharer_port, inv));
                ack_count += 1;
            }
            if let Some(owner) = dir.owner {
                if owner != from_idx {
                    let owner_port = self.port_map.requester_port(owner);
                    let fwd = CoherenceMsg::new(MsgType::GetMForward, line, from_idx, msg.transaction_id);
                    self.pending_sends.push((owner_port, fwd));
                    self.stats.forwards += 1;
                    if let Some(trace) = &self.trace {
                        trace.borrow_mut().record(from_idx, line, TraceEvent::L2Forward, self.tick);
                    }
                }
            }
            let requester_port = self.port_map.requester_port(from_idx);
            let ack = CoherenceMsg::new(MsgType::GetMAck, line, ack_count, msg.transaction_id);
            self.pending_sends.push((requester_port, ack));
            self.stats.invalidations_sent += u64::from(ack_count);
            self.directory.insert(
                line,
                DirEntry {
                    sharers: HashSet::from([from_idx]),
                    owner: Some(from_idx),
                    dirty: true,
                },
            );
            return;
        }
        if let Some(block) = self.blocks.remove(line) {
            let requester_port = self.port_map.requester_port(from_idx);
            let resp = CoherenceMsg::with_data(MsgType::GetMResp, line, 0, msg.transaction_id, block.data);
            self.pending_sends.push((requester_port, resp));
            self.stats.hits += 1;
            if let Some(trace) = &self.trace {
                trace.borrow_mut().record(from_idx, line, TraceEvent::L2Hit, self.tick);
            }
        } else {
            let sub = self.port_map.sub_node_port(line);
            let fwd = CoherenceMsg::new(MsgType::GetMForward, line, from_idx, msg.transaction_id);
            self.pending_sends.push((sub, fwd));
            self.stats.misses += 1;
            if let Some(trace) = &self.trace {
                trace.borrow_mut().record(from_idx, line, TraceEvent::L2Miss, self.tick);
            }
        }
        self.directory.insert(
            line,
            DirEntry {
                sharers: HashSet::from([from_idx]),
                owner: Some(from_idx),
                dirty: true,
            },
        );
    }

    fn handle_put_permission_only(&mut self, from_idx: u32, msg: &CoherenceMsg) {
        let line = msg.line_index;
        if let Some(dir) = self.directory.get_mut(&line) {
            dir.sharers.remove(&from_idx);
            if dir.owner == Some(from_idx) {
                dir.owner = None;
            }
            if dir.sharers.is_empty() {
                self.directory.remove(&line);
            }
        }
        let requester_port = self.port_map.requester_port(from_idx);
        let ack = CoherenceMsg::new(MsgType::PutAck, line, 0, msg.transaction_id);
        self.pending_sends.push((requester_port, ack));
    }

    fn handle_put_with_data(&mut self, from_idx: u32, msg: &CoherenceMsg) {
        let line = msg.line_index;
        let data = msg.data.clone().expect("PutM/PutO carries data");
        if self.blocks.is_full() && !self.blocks.contains(line) {
            let victim = self.blocks.lru_victim().expect("full store has a victim");
            self.evict_block(victim);
        }
        self.blocks.insert(line, CacheLine::new(MoesiState::Shared, data));
        if let Some(dir) = self.directory.get_mut(&line) {
            if dir.owner == Some(from_idx) {
                dir.owner = None;
                dir.dirty = false;
            }
            dir.sharers.remove(&from_idx);
            if dir.sharers.is_empty() {
                self.directory.remove(&line);
            }
        }
        let requester_port = self.port_map.requester_port(from_idx);
        let ack = CoherenceMsg::new(MsgType::PutAck, line, 0, msg.transaction_id);
        self.pending_sends.push((requester_port, ack));
    }

    fn evict_block(&mut self, victim: LineIndex) {
        let block = self.blocks.remove(victim).expect("victim must be resident");
        if let Some(dir) = self.directory.remove(&victim) {
            if !dir.dirty {
                for &sharer in &dir.sharers {
                    let sharer_port = self.port_map.requester_port(sharer);
                    let inv = CoherenceMsg::new(MsgType::Invalidate, victim, sharer, 0);
                    self.pending_sends.push((sharer_port, inv));
                }
            }
        }
        let sub = self.port_map.sub_node_port(victim);
        let writeback = CoherenceMsg::with_data(MsgType::PutM, victim, 0, 0, block.data);
        self.pending_sends.push((sub, writeback));
        self.stats.evictions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::addr::LINE_BYTES;

    struct FlatMap;
    impl BusPortMap for FlatMap {
        fn home_node_port(&self, _line: LineIndex) -> Port {
            Port(100)
        }
        fn sub_node_port(&self, _line: LineIndex) -> Port {
            Port(200)
        }
        fn requester_port(&self, index: u32) -> Port {
            Port(index)
        }
        fn requester_index(&self, port: Port) -> u32 {
            port.0
        }
    }

    fn test_llc() -> (Llc, Rc<RefCell<Bus>>) {
        let bus = Rc::new(RefCell::new(Bus::new(1, 8)));
        let map: Rc<dyn BusPortMap> = Rc::new(FlatMap);
        let llc = Llc::new(0, 1, Port(100), Rc::clone(&bus), map, 4, 1);
        (llc, bus)
    }

    #[test]
    fn gets_directory_and_block_miss_forwards_to_memory() {
        let (mut llc, bus) = test_llc();
        let gets = CoherenceMsg::new(MsgType::GetS, LineIndex::new(1), 0, 0);
        bus.borrow_mut().send(Port(0), Port(100), gets);
        bus.borrow_mut().advance_tick();
        llc.on_current_tick();
        llc.apply_next_tick();
        bus.borrow_mut().advance_tick();
        llc.on_current_tick();
        llc.apply_next_tick();
        let got = bus.borrow_mut().recv(Port(200), Channel::Resp);
        assert!(got.is_some());
        assert_eq!(got.unwrap().1.msg_type, MsgType::GetSForward);
        assert!(llc.directory.contains_key(&LineIndex::new(1)));
    }

    #[test]
    fn wrong_slice_line_triggers_protocol_violation() {
        let bus = Rc::new(RefCell::new(Bus::new(1, 8)));
        let map: Rc<dyn BusPortMap> = Rc::new(FlatMap);
        let mut llc = Llc::new(0, 2, Port(100), Rc::clone(&bus), map, 4, 0);
        let gets = CoherenceMsg::new(MsgType::GetS, LineIndex::new(1), 0, 0);
        bus.borrow_mut().send(Port(0), Port(100), gets);
        bus.borrow_mut().advance_tick();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| llc.on_current_tick()));
        assert!(result.is_err());
    }

    #[test]
    fn put_with_data_clears_dirty_and_ownership() {
        let (mut llc, _bus) = test_llc();
        let line = LineIndex::new(5);
        llc.directory.insert(
            line,
            DirEntry {
                sharers: HashSet::from([0]),
                owner: Some(0),
                dirty: true,
            },
        );
        let msg = CoherenceMsg::with_data(MsgType::PutM, line, 0, 0, Box::new([7u8; LINE_BYTES]));
        llc.handle_put_with_data(0, &msg);
        assert!(llc.directory.get(&line).is_none());
        assert!(llc.blocks.contains(line));
    }
}

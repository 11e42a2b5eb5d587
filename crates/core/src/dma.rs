//! The DMA engine, modeled as a virtual L1 peer that streams to/from a host-memory buffer.
//!
//! `push_dma_requests` splits each request into per-line [`ProcessingUnit`]s; unaligned
//! boundaries produce a head and tail unit with partial offsets. The engine tolerates
//! MSHR-full backpressure by keeping undispatched units on an internal queue rather than
//! ever dropping one.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::bus::{Bus, BusPortMap, Port};
use crate::common::addr::{LINE_BYTES, LINE_SHIFT};
use crate::common::{LineIndex, PhysAddr};
use crate::message::{Channel, CoherenceMsg, MsgType};
use crate::mshr::{MshrTable, TransientState};
use crate::stats::DmaStats;

/// One top-level DMA request, as submitted via [`DmaEngine::push_dma_requests`].
pub struct DmaRequestUnit {
    /// Opaque identifier handed back to the completion callback.
    pub callback_id: u64,
    /// Total byte length of the transfer.
    pub length: usize,
    /// What is being moved and between which kinds of endpoint.
    pub transfer: DmaTransfer,
}

/// The four endpoint combinations a DMA transfer can have.
pub enum DmaTransfer {
    /// Host buffer bytes written into simulated memory starting at `dst`.
    HostToSim { host_data: Vec<u8>, dst: PhysAddr },
    /// Simulated memory starting at `src` copied out to a host buffer.
    SimToHost { src: PhysAddr },
    /// Simulated memory starting at `src` copied to simulated memory starting at `dst`.
    SimToSim { src: PhysAddr, dst: PhysAddr },
    /// Both endpoints are host memory: resolved with a plain `memcpy`, no bus traffic.
    HostToHost { host_data: Vec<u8> },
}

enum UnitOp {
    WriteFromHost { host_offset: usize },
    ReadToHost { host_offset: usize },
    ReadThenWrite { dst_line: LineIndex, dst_offset: usize },
    WriteFromScratch { data: Vec<u8> },
}

/// A single per-line slice of a [`DmaRequestUnit`], produced by splitting on line
/// boundaries (and, for simulated-to-simulated transfers, on *both* endpoints' boundaries).
struct ProcessingUnit {
    request_idx: usize,
    line: LineIndex,
    offset: usize,
    len: usize,
    op: UnitOp,
}

struct InFlightRequest {
    callback_id: u64,
    remaining_units: usize,
    host_out: Option<Vec<u8>>,
    host_in: Option<Vec<u8>>,
}

/// The completion callback: invoked once per top-level request, with the assembled host
/// output buffer for transfers that produce one (`SimToHost`, `HostToHost`), or `None`.
pub type DmaCallback = Box<dyn FnMut(u64, Option<Vec<u8>>)>;

/// The DMA engine.
pub struct DmaEngine {
    index: u32,
    port: Port,
    bus: Rc<RefCell<Bus>>,
    port_map: Rc<dyn BusPortMap>,
    mshrs: MshrTable,
    units_by_line: HashMap<LineIndex, ProcessingUnit>,
    queue: VecDeque<ProcessingUnit>,
    requests: Vec<InFlightRequest>,
    callback: Option<DmaCallback>,
    pending_sends: Vec<(Port, CoherenceMsg)>,
    tick: u64,
    stats: DmaStats,
}

impl DmaEngine {
    /// Builds a new DMA engine.
    #[must_use]
    pub fn new(index: u32, port: Port, port_map: Rc<dyn BusPortMap>, bus: Rc<RefCell<Bus>>, mshr_count: usize) -> Self {
        Self {
            index,
            port,
            bus,
            port_map,
            mshrs: MshrTable::new(mshr_count),
            units_by_line: HashMap::new(),
            queue: VecDeque::new(),
            requests: Vec::new(),
            callback: None,
            pending_sends: Vec::new(),
            tick: 0,
            stats: DmaStats::default(),
        }
    }

    /// Registers the completion callback, replacing any previous one.
    pub fn set_handler(&mut self, callback: DmaCallback) {
        self.callback = Some(callback);
    }

    /// Returns this engine's bus port.
    #[must_use]
    pub fn port(&self) -> Port {
        self.port
    }

    /// Returns a snapshot of this engine's statistics.
    #[must_use]
    pub fn stats(&self) -> DmaStats {
        self.stats
    }

    /// Returns the number of units still queued, awaiting MSHR admission.
    #[must_use]
    pub fn queued_units(&self) -> usize {
        self.queue.len()
    }

    /// Submits a batch of DMA requests, splitting each into per-line processing units.
    pub fn push_dma_requests(&mut self, reqs: Vec<DmaRequestUnit>) {
        for req in reqs {
            match req.transfer {
                DmaTransfer::HostToHost { host_data } => {
                    self.stats.requests_completed += 1;
                    if let Some(cb) = &mut self.callback {
                        cb(req.callback_id, Some(host_data));
                    }
                }
                DmaTransfer::HostToSim { host_data, dst } => {
                    let points = line_breakpoints(dst, req.length);
                    let request_idx = self.requests.len();
                    let units = points
                        .windows(2)
                        .map(|w| {
                            let (start, end) = (w[0], w[1]);
                            let (line, offset) = addr_at(dst, start);
                            ProcessingUnit {
                                request_idx,
                                line,
                                offset,
                                len: end - start,
                                op: UnitOp::WriteFromHost { host_offset: start },
                            }
                        })
                        .collect::<Vec<_>>();
                    self.requests.push(InFlightRequest {
                        callback_id: req.callback_id,
                        remaining_units: units.len(),
                        host_out: None,
                        host_in: Some(host_data),
                    });
                    self.queue.extend(units);
                }
                DmaTransfer::SimToHost { src } => {
                    let points = line_breakpoints(src, req.length);
                    let request_idx = self.requests.len();
                    let units = points
                        .windows(2)
                        .map(|w| {
                            let (start, end) = (w[0], w[1]);
                            let (line, offset) = addr_at(src, start);
                            ProcessingUnit {
                                request_idx,
                                line,
                                offset,
                                len: end - start,
                                op: UnitOp::ReadToHost { host_offset: start },
                            }
                        })
                        .collect::<Vec<_>>();
                    self.requests.push(InFlightRequest {
                        callback_id: req.callback_id,
                        remaining_units: units.len(),
                        host_out: Some(vec![0u8; req.length]),
                        host_in: None,
                    });
                    self.queue.extend(units);
                }
                DmaTransfer::SimToSim { src, dst } => {
                    let points = combined_breakpoints(src, dst, req.length);
                    let request_idx = self.requests.len();
                    let units = points
                        .windows(2)
                        .map(|w| {
                            let (start, end) = (w[0], w[1]);
                            let (src_line, src_off) = addr_at(src, start);
                            let (dst_line, dst_off) = addr_at(dst, start);
                            ProcessingUnit {
                                request_idx,
                                line: src_line,
                                offset: src_off,
                                len: end - start,
                                op: UnitOp::ReadThenWrite { dst_line, dst_offset: dst_off },
                            }
                        })
                        .collect::<Vec<_>>();
                    self.requests.push(InFlightRequest {
                        callback_id: req.callback_id,
                        remaining_units: units.len(),
                        host_out: None,
                        host_in: None,
                    });
                    self.queue.extend(units);
                }
            }
        }
    }

    /// Phase 1: process one inbound message, then admit one queued unit if room allows.
    pub fn on_current_tick(&mut self) {
        if let Some((_from, msg)) = self.pop_inbound() {
            self.process_inbound(msg);
        }
        self.admit_from_queue();
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

    fn pop_inbound(&mut self) -> Option<(Port, CoherenceMsg)> {
        for channel in [Channel::Ack, Channel::Resp, Channel::Req] {
            let popped = self.bus.borrow_mut().recv(self.port, channel);
            if popped.is_some() {
                return popped;
            }
        }
        None
    }

    fn admit_from_queue(&mut self) {
        let Some(unit) = self.queue.pop_front() else { return };
        if let Err(unit) = self.start_unit(unit) {
            self.queue.push_front(unit);
            self.stats.units_deferred += 1;
        }
    }

    fn start_unit(&mut self, unit: ProcessingUnit) -> Result<(), ProcessingUnit> {
        if self.mshrs.get(unit.line).is_some() {
            return Err(unit);
        }
        let (ty, transient) = match &unit.op {
            UnitOp::WriteFromHost { .. } | UnitOp::WriteFromScratch { .. } => (MsgType::GetM, TransientState::ItoM),
            UnitOp::ReadToHost { .. } | UnitOp::ReadThenWrite { .. } => (MsgType::GetS, TransientState::ItoS),
        };
        if self.mshrs.is_full() {
            return Err(unit);
        }
        let home = self.port_map.home_node_port(unit.line);
        if !self.bus.borrow().can_send(home, ty.channel()) {
            return Err(unit);
        }
        self.mshrs.alloc(unit.line, transient, self.tick);
        let msg = CoherenceMsg::new(ty, unit.line, self.index, 0);
        let sent = self.bus.borrow_mut().send(self.port, home, msg);
        debug_assert!(sent, "can_send just confirmed capacity");
        self.units_by_line.insert(unit.line, unit);
        self.stats.units_processed += 1;
        Ok(())
    }

    fn process_inbound(&mut self, msg: CoherenceMsg) {
        match msg.msg_type {
            MsgType::Invalidate => self.handle_invalidate(&msg),
            MsgType::InvAck => {
                if let Some(entry) = self.mshrs.get_mut(msg.line_index) {
                    entry.invalid_ack += 1;
                }
                self.try_complete_write(msg.line_index);
            }
            MsgType::GetMAck => {
                if let Some(entry) = self.mshrs.get_mut(msg.line_index) {
                    entry.need_invalid_ack = Some(msg.arg);
                }
                self.try_complete_write(msg.line_index);
            }
            MsgType::GetMResp => self.handle_getm_resp(&msg),
            MsgType::GetSResp | MsgType::GetRespMem => {
                let data = msg.data.clone().expect("data-carrying response");
                self.complete_read(msg.line_index, &data);
            }
            MsgType::PutAck => self.handle_put_ack(msg.line_index),
            other => crate::protocol_violation!("DMA engine received unexpected {other:?}"),
        }
    }

    fn handle_invalidate(&mut self, msg: &CoherenceMsg) {
        let line = msg.line_index;
        if let Some(entry) = self.mshrs.get_mut(line) {
            entry.state = entry.state.coalesce_on_invalidate();
        }
        let requester_port = self.port_map.requester_port(msg.arg);
        let ack = CoherenceMsg::new(MsgType::InvAck, line, self.index, msg.transaction_id);
        self.pending_sends.push((requester_port, ack));
    }

    fn handle_getm_resp(&mut self, msg: &CoherenceMsg) {
        let line = msg.line_index;
        let Some(entry) = self.mshrs.get_mut(line) else {
            crate::protocol_violation!("GetMResp for line {line:?} with no MSHR");
        };
        let data = msg.data.clone().expect("GetMResp carries data");
        entry.scratch.copy_from_slice(data.as_slice());
        entry.data_received = true;
        if entry.need_invalid_ack.is_none() {
            entry.need_invalid_ack = Some(msg.arg);
        }
        self.try_complete_write(line);
    }

    fn try_complete_write(&mut self, line: LineIndex) {
        let Some(entry) = self.mshrs.get(line) else { return };
        if entry.state != TransientState::ItoM || !entry.is_complete() {
            return;
        }
        self.merge_and_writeback(line);
    }

    fn merge_and_writeback(&mut self, line: LineIndex) {
        let unit = self.units_by_line.get(&line).expect("unit tracked while MSHR active");
        let (offset, len, source): (usize, usize, Vec<u8>) = match &unit.op {
            UnitOp::WriteFromHost { host_offset } => {
                let req = &self.requests[unit.request_idx];
                let host_in = req.host_in.as_ref().expect("HostToSim units always carry host_in");
                (unit.offset, unit.len, host_in[*host_offset..*host_offset + unit.len].to_vec())
            }
            UnitOp::WriteFromScratch { data } => (unit.offset, unit.len, data.clone()),
            _ => unreachable!("merge_and_writeback only called for write-kind units"),
        };
        let entry = self.mshrs.get_mut(line).expect("MSHR active for this unit");
        entry.scratch[offset..offset + len].copy_from_slice(&source);
        entry.state = TransientState::MtoI;
        let home = self.port_map.home_node_port(line);
        let msg = CoherenceMsg::with_data(MsgType::PutM, line, self.index, 0, entry.scratch.clone());
        self.pending_sends.push((home, msg));
    }

    fn complete_read(&mut self, line: LineIndex, data: &[u8; LINE_BYTES]) {
        let unit = self.units_by_line.get(&line).expect("unit tracked for active read");
        let (offset, len, request_idx) = (unit.offset, unit.len, unit.request_idx);
        let continuation = match &unit.op {
            UnitOp::ReadToHost { host_offset } => {
                let host_offset = *host_offset;
                let req = &mut self.requests[request_idx];
                req.host_out.as_mut().expect("ReadToHost units always carry host_out")[host_offset..host_offset + len]
                    .copy_from_slice(&data[offset..offset + len]);
                None
            }
            UnitOp::ReadThenWrite { dst_line, dst_offset } => Some(ProcessingUnit {
                request_idx,
                line: *dst_line,
                offset: *dst_offset,
                len,
                op: UnitOp::WriteFromScratch { data: data[offset..offset + len].to_vec() },
            }),
            _ => unreachable!("complete_read only called for read-kind units"),
        };
        if let Some(cont) = continuation {
            self.queue.push_back(cont);
        }
        let entry = self.mshrs.get_mut(line).expect("MSHR active for read completion");
        entry.state = TransientState::StoI;
        let home = self.port_map.home_node_port(line);
        let put = CoherenceMsg::new(MsgType::PutS, line, self.index, 0);
        self.pending_sends.push((home, put));
    }

    fn handle_put_ack(&mut self, line: LineIndex) {
        if self.mshrs.free(line).is_none() {
            crate::protocol_violation!("PutAck for line {line:?} with no MSHR");
        }
        let Some(unit) = self.units_by_line.remove(&line) else {
            crate::protocol_violation!("PutAck for line {line:?} with no tracked unit");
        };
        if matches!(unit.op, UnitOp::ReadThenWrite { .. }) {
            // Non-terminal: the logical transfer completes when its WriteFromScratch
            // continuation retires, not here.
            return;
        }
        let req = &mut self.requests[unit.request_idx];
        req.remaining_units -= 1;
        if req.remaining_units == 0 {
            self.stats.requests_completed += 1;
            let callback_id = req.callback_id;
            let host_out = req.host_out.take();
            if let Some(cb) = &mut self.callback {
                cb(callback_id, host_out);
            }
        }
    }
}

fn addr_at(anchor: PhysAddr, pos: usize) -> (LineIndex, usize) {
    let a = PhysAddr::new(anchor.val() + pos as u64);
    (a.line_index(), a.line_offset())
}

/// Returns the byte offsets within `[0, len)` where `addr + offset` crosses a line
/// boundary, always including `0` and `len`.
fn line_breakpoints(addr: PhysAddr, len: usize) -> Vec<usize> {
    let mut points = vec![0usize];
    let mut pos = 0usize;
    while pos < len {
        let cur = PhysAddr::new(addr.val() + pos as u64);
        let next_line_start = (cur.line_index().val() + 1) << LINE_SHIFT;
        let bytes_left_in_line = (next_line_start - cur.val()) as usize;
        pos += bytes_left_in_line.min(len - pos);
        points.push(pos);
    }
    points
}

/// Breakpoints that respect both `a`'s and `b`'s line boundaries, for transfers whose two
/// simulated-memory endpoints may have different alignments.
fn combined_breakpoints(a: PhysAddr, b: PhysAddr, len: usize) -> Vec<usize> {
    let mut points: Vec<usize> = line_breakpoints(a, len).into_iter().chain(line_breakpoints(b, len)).collect();
    points.sort_unstable();
    points.dedup();
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap as StdHashMap;
    use std::rc::Rc as StdRc;

    struct FlatMap {
        home: Port,
        sub: Port,
        requesters: StdHashMap<u32, Port>,
    }
    impl BusPortMap for FlatMap {
        fn home_node_port(&self, _line: LineIndex) -> Port {
            self.home
        }
        fn sub_node_port(&self, _line: LineIndex) -> Port {
            self.sub
        }
        fn requester_port(&self, index: u32) -> Port {
            self.requesters[&index]
        }
        fn requester_index(&self, port: Port) -> u32 {
            port.0
        }
    }

    fn test_engine() -> (DmaEngine, Rc<RefCell<Bus>>) {
        let bus = Rc::new(RefCell::new(Bus::new(0, 16)));
        let mut requesters = StdHashMap::new();
        requesters.insert(9u32, Port(9));
        let map: Rc<dyn BusPortMap> = Rc::new(FlatMap {
            home: Port(100),
            sub: Port(200),
            requesters,
        });
        let engine = DmaEngine::new(9, Port(9), map, Rc::clone(&bus), 8);
        (engine, bus)
    }

    #[test]
    fn line_breakpoints_splits_unaligned_head_and_tail() {
        // Starting 4 bytes before a line boundary, a 12-byte access crosses exactly once:
        // a 4-byte head unit in the first line, an 8-byte tail unit in the next.
        let points = line_breakpoints(PhysAddr::new(LINE_BYTES as u64 - 4), 12);
        assert_eq!(points, vec![0, 4, 12]);
    }

    #[test]
    fn host_to_host_completes_synchronously() {
        let (mut engine, _bus) = test_engine();
        let done = StdRc::new(Cell::new(false));
        let done2 = StdRc::clone(&done);
        engine.set_handler(Box::new(move |_id, data| {
            assert_eq!(data.unwrap(), vec![1, 2, 3]);
            done2.set(true);
        }));
        engine.push_dma_requests(vec![DmaRequestUnit {
            callback_id: 1,
            length: 3,
            transfer: DmaTransfer::HostToHost { host_data: vec![1, 2, 3] },
        }]);
        assert!(done.get());
    }

    #[test]
    fn host_to_sim_splits_into_one_unit_when_aligned() {
        let (mut engine, _bus) = test_engine();
        engine.push_dma_requests(vec![DmaRequestUnit {
            callback_id: 2,
            length: 16,
            transfer: DmaTransfer::HostToSim {
                host_data: vec![5u8; 16],
                dst: PhysAddr::new(0),
            },
        }]);
        assert_eq!(engine.queued_units(), 1);
    }

    #[test]
    fn backpressure_defers_units_when_mshrs_are_full() {
        let (mut engine, _bus) = test_engine();
        // Fill every MSHR slot with unrelated in-flight transactions.
        for i in 0..8u64 {
            engine.mshrs.alloc(LineIndex::new(1000 + i), TransientState::ItoM, 0);
        }
        engine.push_dma_requests(vec![DmaRequestUnit {
            callback_id: 3,
            length: 8,
            transfer: DmaTransfer::HostToSim {
                host_data: vec![1u8; 8],
                dst: PhysAddr::new(0),
            },
        }]);
        engine.on_current_tick();
        assert_eq!(engine.stats().units_deferred, 1);
        assert_eq!(engine.queued_units(), 1);
    }
}

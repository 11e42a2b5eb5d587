//! Top-level simulator: owns every component and the bus that connects them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bus::{Bus, BusPortMap, Port};
use crate::common::LineIndex;
use crate::config::Config;
use crate::dma::DmaEngine;
use crate::l1::L1Cache;
use crate::llc::Llc;
use crate::memnode::{MemoryNode, ModuloLineMap};
use crate::stats::SimStats;
use crate::trace::CacheEventTrace;

/// Routes lines and requester indices to bus ports for a system of `num_cores` L1s, one DMA
/// engine, `llc_slices` LLC shards, and `mem_nodes` memory nodes.
///
/// Port numbering: `[0, num_cores)` are L1s, `num_cores` is the DMA engine, the next
/// `llc_slices` are LLC shards, and the remaining `mem_nodes` are memory nodes.
struct SystemPortMap {
    num_cores: u32,
    llc_slices: u64,
    mem_nodes: u64,
    llc_base: u32,
    mem_base: u32,
}

impl SystemPortMap {
    fn dma_index(&self) -> u32 {
        self.num_cores
    }
}

impl BusPortMap for SystemPortMap {
    fn home_node_port(&self, line: LineIndex) -> Port {
        Port(self.llc_base + (line.val() % self.llc_slices) as u32)
    }

    fn sub_node_port(&self, line: LineIndex) -> Port {
        Port(self.mem_base + (line.val() % self.mem_nodes) as u32)
    }

    fn requester_port(&self, index: u32) -> Port {
        Port(index)
    }

    fn requester_index(&self, port: Port) -> u32 {
        port.0
    }
}

/// Owns every L1, the sharded LLC, every memory node, the DMA engine, and the bus
/// connecting them. Drives the system one tick at a time via [`Simulator::tick`].
pub struct Simulator {
    l1s: Vec<L1Cache>,
    llc: Vec<Llc>,
    mem: Vec<MemoryNode>,
    dma: DmaEngine,
    bus: Rc<RefCell<Bus>>,
    trace: Option<Rc<RefCell<CacheEventTrace>>>,
    tick: u64,
}

/// Topology parameters for [`Simulator::new`]: component counts not carried by [`Config`]
/// (which only holds per-component tuning, not how many of each component exist).
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    /// Number of private L1 caches (CPU cores).
    pub num_cores: usize,
    /// Number of memory nodes sharing backing storage.
    pub num_mem_nodes: usize,
    /// Bytes of backing storage per memory node.
    pub mem_bytes_per_node: usize,
}

impl Simulator {
    /// Builds a new simulator: every component, wired together over one shared bus.
    #[must_use]
    pub fn new(config: &Config, topology: Topology) -> Self {
        let bus = Rc::new(RefCell::new(Bus::new(config.bus.latency_cycles, 64)));
        let llc_slices = config.llc.nuca_slices;
        let num_cores = topology.num_cores as u32;
        let llc_base = num_cores + 1;
        let mem_base = llc_base + llc_slices as u32;
        let port_map: Rc<dyn BusPortMap> = Rc::new(SystemPortMap {
            num_cores,
            llc_slices,
            mem_nodes: topology.num_mem_nodes as u64,
            llc_base,
            mem_base,
        });

        let l1s = (0..topology.num_cores)
            .map(|i| {
                L1Cache::new(
                    i as u32,
                    Port(i as u32),
                    Rc::clone(&port_map),
                    Rc::clone(&bus),
                    config.l1.capacity_lines,
                    config.l1.mshr_count,
                )
            })
            .collect();

        let llc = (0..llc_slices)
            .map(|i| {
                Llc::new(
                    i,
                    llc_slices,
                    Port(llc_base + i as u32),
                    Rc::clone(&bus),
                    Rc::clone(&port_map),
                    config.llc.capacity_lines,
                    config.llc.index_latency,
                )
            })
            .collect();

        let mem = (0..topology.num_mem_nodes)
            .map(|i| {
                let addr_map: Rc<dyn crate::memnode::MemCtrlLineAddrMap> =
                    Rc::new(ModuloLineMap::new(i as u64, topology.num_mem_nodes as u64));
                MemoryNode::new(
                    Port(mem_base + i as u32),
                    Rc::clone(&bus),
                    Rc::clone(&port_map),
                    addr_map,
                    topology.mem_bytes_per_node,
                    config.memory.dwidth_bytes,
                    config.memory.access_buf_depth,
                )
            })
            .collect();

        let dma_port = Port(num_cores);
        let dma = DmaEngine::new(num_cores, dma_port, Rc::clone(&port_map), Rc::clone(&bus), config.dma.mshr_count);

        Self {
            l1s,
            llc,
            mem,
            dma,
            bus,
            trace: None,
            tick: 0,
        }
    }

    /// Enables per-transaction tracing on every L1 and every LLC slice.
    pub fn enable_trace(&mut self) {
        let trace = Rc::new(RefCell::new(CacheEventTrace::new()));
        for l1 in &mut self.l1s {
            l1.attach_trace(Rc::clone(&trace));
        }
        for slice in &mut self.llc {
            slice.attach_trace(Rc::clone(&trace));
        }
        self.trace = Some(trace);
    }

    /// Returns the attached trace collector, if tracing was enabled.
    #[must_use]
    pub fn trace(&self) -> Option<Rc<RefCell<CacheEventTrace>>> {
        self.trace.clone()
    }

    /// Returns a mutable reference to core `index`'s L1 controller.
    #[must_use]
    pub fn l1_mut(&mut self, index: usize) -> &mut L1Cache {
        &mut self.l1s[index]
    }

    /// Returns a mutable reference to memory node `index`, for test/fixture seeding.
    #[must_use]
    pub fn mem_mut(&mut self, index: usize) -> &mut MemoryNode {
        &mut self.mem[index]
    }

    /// Returns a mutable reference to the DMA engine.
    #[must_use]
    pub fn dma_mut(&mut self) -> &mut DmaEngine {
        &mut self.dma
    }

    /// Returns the number of ticks the simulator has advanced.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Advances every component by exactly one clock cycle: each component's
    /// `on_current_tick()`, then each component's `apply_next_tick()`, then the bus's own
    /// tick counter. This two-phase split keeps every component's step free of ordering
    /// dependence on its peers within the same tick.
    pub fn tick(&mut self) {
        for l1 in &mut self.l1s {
            l1.on_current_tick();
        }
        for slice in &mut self.llc {
            slice.on_current_tick();
        }
        for node in &mut self.mem {
            node.on_current_tick();
        }
        self.dma.on_current_tick();

        for l1 in &mut self.l1s {
            l1.apply_next_tick();
        }
        for slice in &mut self.llc {
            slice.apply_next_tick();
        }
        for node in &mut self.mem {
            node.apply_next_tick();
        }
        self.dma.apply_next_tick();

        self.bus.borrow_mut().advance_tick();
        self.tick += 1;
    }

    /// Runs the simulator for `ticks` cycles.
    pub fn run_for(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Gathers a snapshot of every component's statistics.
    #[must_use]
    pub fn stats(&self) -> SimStats {
        let mut stats = SimStats::new(self.l1s.len(), self.llc.len(), self.mem.len());
        for (i, l1) in self.l1s.iter().enumerate() {
            stats.l1[i] = l1.stats();
        }
        for (i, slice) in self.llc.iter().enumerate() {
            stats.llc[i] = slice.stats();
        }
        for (i, node) in self.mem.iter().enumerate() {
            stats.memory[i] = node.stats();
        }
        stats.dma = self.dma.stats();
        stats.ticks = self.tick;
        stats
    }
}

//! MOESI coherence simulator CLI.
//!
//! This binary provides a single entry point for running the simulator's built-in
//! multi-core coherence scenarios and printing the resulting per-component statistics.

use clap::{Parser, Subcommand, ValueEnum};
use std::process;

use moesi_sim_core::common::{AccessOutcome, PhysAddr};
use moesi_sim_core::config::Config;
use moesi_sim_core::dma::{DmaRequestUnit, DmaTransfer};
use moesi_sim_core::sim::Topology;
use moesi_sim_core::Simulator;

#[derive(Parser, Debug)]
#[command(
    name = "moesi-sim",
    author,
    version,
    about = "MOESI cache-coherence simulator",
    long_about = "Runs one of the simulator's built-in multi-core coherence scenarios and \
                   prints the resulting per-component statistics.\n\nExamples:\n  moesi-sim run producer\n  moesi-sim run spinlock --ticks 400000\n  moesi-sim list"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a built-in scenario to completion and print its statistics.
    Run {
        /// Which scenario to run.
        scenario: Scenario,

        /// Upper bound on the number of ticks before giving up.
        #[arg(long, default_value_t = 200_000)]
        ticks: u64,

        /// Enable per-transaction cache-event tracing on every L1 and LLC slice.
        #[arg(long)]
        trace: bool,
    },

    /// List the built-in scenarios.
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scenario {
    /// Single-core 1 MiB producer, cross-core reader.
    Producer,
    /// 4-core spinlock (LR/SC) incrementing a shared counter.
    Spinlock,
    /// 4-core `amoadd.d` race on one address.
    AmoAdd,
    /// Host-to-simulated-memory DMA transfer.
    Dma,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { scenario, ticks, trace }) => run_scenario(scenario, ticks, trace),
        Some(Commands::List) => list_scenarios(),
        None => {
            eprintln!("MOESI coherence simulator — pass a subcommand");
            eprintln!();
            eprintln!("  moesi-sim run <scenario>   Run a built-in scenario");
            eprintln!("  moesi-sim list             List built-in scenarios");
            eprintln!();
            eprintln!("  moesi-sim --help  for full options");
            process::exit(1);
        }
    }
}

fn list_scenarios() {
    println!("Built-in scenarios:");
    println!("  producer  Single-core 1 MiB write, cross-core read-back");
    println!("  spinlock  4 cores contend for an LR/SC spinlock guarding a shared counter");
    println!("  amo-add   4 cores race amoadd.d on one shared address");
    println!("  dma       A host buffer is copied into simulated memory via the DMA engine");
}

fn run_scenario(scenario: Scenario, max_ticks: u64, trace: bool) {
    println!("[*] Running scenario: {scenario:?}");
    let stats = match scenario {
        Scenario::Producer => producer_consumer(max_ticks, trace),
        Scenario::Spinlock => spinlock(max_ticks, trace),
        Scenario::AmoAdd => amo_add(max_ticks, trace),
        Scenario::Dma => dma_transfer(max_ticks, trace),
    };
    println!();
    println!("{stats}");
}

fn new_sim(num_cores: usize, num_mem_nodes: usize, mem_bytes_per_node: usize, trace: bool) -> Simulator {
    let config = Config::default();
    let topology = Topology { num_cores, num_mem_nodes, mem_bytes_per_node };
    let mut sim = Simulator::new(&config, topology);
    if trace {
        sim.enable_trace();
    }
    sim
}

fn store_until(sim: &mut Simulator, core: usize, addr: PhysAddr, data: &[u8], max_ticks: u64) {
    for _ in 0..max_ticks {
        if sim.l1_mut(core).store(addr, data.len(), data) == AccessOutcome::Success {
            return;
        }
        sim.tick();
    }
    panic!("store on core {core} at {addr:?} never completed within {max_ticks} ticks");
}

fn load_until(sim: &mut Simulator, core: usize, addr: PhysAddr, len: usize, max_ticks: u64) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    for _ in 0..max_ticks {
        if sim.l1_mut(core).load(addr, len, &mut buf) == AccessOutcome::Success {
            return buf;
        }
        sim.tick();
    }
    panic!("load on core {core} at {addr:?} never completed within {max_ticks} ticks");
}

fn producer_consumer(max_ticks: u64, trace: bool) -> moesi_sim_core::stats::SimStats {
    let mut sim = new_sim(2, 1, 2 << 20, trace);
    let base = 0x1_0000u64;
    let count = 131_072usize;
    let per_op_ticks = max_ticks.max(1);

    for i in 0..count {
        let addr = PhysAddr::new(base + (i as u64) * 8);
        store_until(&mut sim, 0, addr, &(i as u64).to_le_bytes(), per_op_ticks);
    }
    for i in 0..count {
        let addr = PhysAddr::new(base + (i as u64) * 8);
        let got = load_until(&mut sim, 1, addr, 8, per_op_ticks);
        let val = u64::from_le_bytes(got.try_into().expect("8-byte load"));
        assert_eq!(val, i as u64, "producer/consumer mismatch at index {i}");
    }
    println!("    wrote and verified {count} words ({} bytes)", count * 8);
    sim.stats()
}

#[derive(Clone, Copy, PartialEq)]
enum LockPhase {
    Acquire,
    Bump,
    Release,
}

fn spinlock(max_ticks: u64, trace: bool) -> moesi_sim_core::stats::SimStats {
    let mut sim = new_sim(4, 1, 1 << 20, trace);
    let lock_addr = PhysAddr::new(0x1_0000);
    let counter_addr = PhysAddr::new(0x1_0008);
    let mut phases = [LockPhase::Acquire; 4];
    let mut rounds_left = [100u32; 4];

    for _tick in 0..max_ticks {
        if rounds_left.iter().all(|&r| r == 0) {
            break;
        }
        for idx in 0..4 {
            if rounds_left[idx] == 0 {
                continue;
            }
            match phases[idx] {
                LockPhase::Acquire => {
                    let mut lock_val = [0u8; 8];
                    let got = sim.l1_mut(idx).load_reserved(lock_addr, 8, &mut lock_val);
                    if got == AccessOutcome::Success && u64::from_le_bytes(lock_val) == 0 {
                        let one = 1u64.to_le_bytes();
                        if sim.l1_mut(idx).store_conditional(lock_addr, 8, &one) == AccessOutcome::Success {
                            phases[idx] = LockPhase::Bump;
                        }
                    }
                }
                LockPhase::Bump => {
                    let mut counter_val = [0u8; 8];
                    if sim.l1_mut(idx).load(counter_addr, 8, &mut counter_val) == AccessOutcome::Success {
                        let next = (u64::from_le_bytes(counter_val) + 1).to_le_bytes();
                        if sim.l1_mut(idx).store(counter_addr, 8, &next) == AccessOutcome::Success {
                            phases[idx] = LockPhase::Release;
                        }
                    }
                }
                LockPhase::Release => {
                    let zero = 0u64.to_le_bytes();
                    if sim.l1_mut(idx).store(lock_addr, 8, &zero) == AccessOutcome::Success {
                        rounds_left[idx] -= 1;
                        phases[idx] = LockPhase::Acquire;
                    }
                }
            }
        }
        sim.tick();
    }

    let counter = load_until(&mut sim, 0, counter_addr, 8, 500);
    println!(
        "    final counter = {} (expected 400)",
        u64::from_le_bytes(counter.try_into().expect("8-byte load"))
    );
    sim.stats()
}

fn amo_add(max_ticks: u64, trace: bool) -> moesi_sim_core::stats::SimStats {
    let mut sim = new_sim(4, 1, 1 << 20, trace);
    let addr = PhysAddr::new(0x2_0000);
    let mut remaining = [1000u32; 4];

    for _tick in 0..max_ticks {
        if remaining.iter().all(|&r| r == 0) {
            break;
        }
        for core in 0..4 {
            if remaining[core] == 0 {
                continue;
            }
            let mut rhs = 1i64.to_le_bytes();
            if sim.l1_mut(core).amo(moesi_sim_core::l1::AmoOp::Add, addr, 8, &mut rhs) == AccessOutcome::Success {
                remaining[core] -= 1;
            }
        }
        sim.tick();
    }

    let total = load_until(&mut sim, 0, addr, 8, 500);
    println!(
        "    final total = {} (expected 4000)",
        i64::from_le_bytes(total.try_into().expect("8-byte load"))
    );
    sim.stats()
}

fn dma_transfer(max_ticks: u64, trace: bool) -> moesi_sim_core::stats::SimStats {
    let mut sim = new_sim(1, 1, 1 << 16, trace);
    let dst = PhysAddr::new(0x1000);
    let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();

    sim.dma_mut().push_dma_requests(vec![DmaRequestUnit {
        callback_id: 7,
        length: payload.len(),
        transfer: DmaTransfer::HostToSim { host_data: payload.clone(), dst },
    }]);

    for _ in 0..max_ticks {
        sim.tick();
        if sim.dma_mut().stats().requests_completed > 0 {
            break;
        }
    }
    println!(
        "    DMA request completed; {} units deferred by MSHR backpressure",
        sim.dma_mut().stats().units_deferred
    );
    sim.stats()
}

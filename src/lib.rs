//! # qn_sim - Queueing Network Simulation
//!
//! A discrete-event engine for studying congestion, latency and failure in a
//! network of capacity-limited servers. Synthetic transactions are routed hop
//! by hop through pools of servers while a seasonality table drives the
//! arrival rate.
//!
//! ## Core Components
//!
//! - **Scheduler**: virtual clock, event queue ordered by (time, insertion), process lifecycle
//! - **Process**: cooperative state machines resumed at named suspension points
//! - **Server**: capacity-limited resource with priority preemption
//! - **ServerPool / PoolRegistry**: least-loaded selection per server kind
//! - **Router**: drives one transaction through its kinds, with loop compaction
//! - **ArrivalGenerator**: spawns routers at seasonality-scaled intervals
//! - **FaultInjector**: periodic outages that preempt ordinary traffic
//!
//! ## Usage
//!
//! ```no_run
//! use qn_sim::{CollectorEventSink, SimConfig, Simulation};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let config = SimConfig {
//!     runtime: 50.0,
//!     seed: Some([7u8; 32]),
//!     ..SimConfig::default()
//! };
//!
//! let collector = Rc::new(RefCell::new(CollectorEventSink::new()));
//! let mut sim = Simulation::new(config).unwrap();
//! sim.attach(Box::new(collector.clone()));
//!
//! let result = sim.run().unwrap();
//! result.print_summary();
//! println!("{} records", collector.borrow().records.len());
//! ```
//!
//! The record stream reaching attached [`EventSink`]s is the only output of a
//! run. File and console adapters live with the binaries in `simulator/`.

// Engine
pub mod qn_interface;
pub mod qn_process;
pub mod qn_scheduler;

// Resources
pub mod qn_pool;
pub mod qn_server;

// Workload
pub mod qn_faults;
pub mod qn_generator;
pub mod qn_router;
pub mod qn_seasonality;

// Wiring
pub mod qn_config;
pub mod qn_simulation;
pub mod qn_sinks;

// Re-export commonly used types
pub use qn_config::{
    ConfigError, FaultConfig, PoolConfig, SeasonalityConfig, SimConfig, TransactionConfig,
};
pub use qn_generator::GeneratorMode;
pub use qn_interface::{
    EventRecord, EventSink, LoadMetrics, NoOpSink, ProcessId, ServerId, SimTime, Status,
    TransactionId,
};
pub use qn_scheduler::{RunStats, Scheduler, SimError};
pub use qn_seasonality::{SeasonalityError, SeasonalityTable};
pub use qn_simulation::{seed_hex, SimResult, Simulation};
pub use qn_sinks::{CollectorEventSink, ConsoleEventSink, MultiEventSink};

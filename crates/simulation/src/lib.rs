//! Deterministic simulation harness for the Palisade replication core.
//!
//! Runs a whole deployment (replicas plus clients) as synchronous state
//! machines over one ordered event queue with simulated time, latency,
//! packet loss, partitions, and fault injection. Same seed, same run.

mod kernel;
mod network;
mod runner;

pub use kernel::{EchoKernel, MemoryLedger};
pub use network::{SimConfig, SimulatedNetwork};
pub use runner::{Endpoint, SimulationRunner, SimulationStats};

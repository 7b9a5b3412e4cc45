//! Deterministic simulation and property-based test tooling for the packet
//! protocol.
//!
//! [`SimEnv`] is a turmoil-backed [`packet_core::Environment`] (virtual
//! clock, seeded RNG); [`sim_node::SimNode`] drives
//! [`packet_net::driver::NodeDriver`] over turmoil's deterministic TCP so the
//! timer-driven scenarios of §8 (heartbeat, idle reap, dead-peer reap) run
//! without wall-clock sleeps. [`scenarios`] implements the six end-to-end
//! scenarios as tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scenarios;
pub mod sim_env;
pub mod sim_node;

pub use sim_env::SimEnv;
pub use sim_node::{Delivered, SimNode};

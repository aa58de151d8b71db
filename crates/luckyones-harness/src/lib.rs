//! Deterministic simulation harness for LuckyOnes.
//!
//! [`SimEnv`] replaces the system clock and OS randomness with a manually
//! advanced clock and a seeded RNG. [`SimNetwork`] wires a relay driver and
//! any number of client routers together in memory, pumping frames until the
//! network is quiescent. Same seed, same run.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_network;

pub use sim_env::{SimEnv, SimInstant};
pub use sim_network::{ClientHandle, SimError, SimNetwork, SimRouter};

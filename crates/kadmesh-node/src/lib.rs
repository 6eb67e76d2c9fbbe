//! Kadmesh node
//!
//! Configuration and an in-memory network simulation for the Kadmesh DHT.

pub mod config;
pub mod sim;

pub use config::Config;
pub use sim::{run_simulation, SimRegistry, SimulationParams, SimulationReport};

//! Fleetd core library
//!
//! Remote shell sessions, definition-driven tests and fixes, runtime health
//! state and the background monitor for a fleet of robots. The transport
//! layer talks to [`manager::FleetManager`]; everything else is exposed for
//! embedding and tests.

pub mod catalog;
pub mod config;
pub mod definitions;
pub mod error;
pub mod executor;
pub mod fixes;
pub mod guard;
pub mod manager;
pub mod monitor;
pub mod probes;
pub mod runner;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod testing;

pub use error::{FleetError, FleetResult};
pub use manager::FleetManager;

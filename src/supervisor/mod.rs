//! Supervisor module for engine lifecycle and request management.

mod events;
mod pending;
mod registry;
mod runner;
mod state;

pub use events::*;
pub use pending::*;
pub use registry::*;
pub use runner::*;
pub use state::*;

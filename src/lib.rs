// === Public Modules (The Canonical Paths) ===
pub mod compat;
pub mod config;
pub mod driver;
pub mod engine;
pub mod entity;
pub mod error;
pub mod external;
pub mod geom;
pub mod output;
pub mod sim;
pub mod wire;

// === Private Implementation Details ===
mod macros;

// === Convenience ===
pub mod sorted_vec_map;

// === Facades (Re-exporting internals) ===
pub use crate::engine::value::EngineValue;
pub use crate::entity::program::{Program, ProgramBuilder};
pub use crate::error::{VeldError, VeldResult};
pub use crate::sim::stepper::{RunOptions, Stepper};

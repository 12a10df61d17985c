//! JSON export of solver state.

pub mod snapshot;

pub use snapshot::{write_debug_snapshot, write_solution_json};

//! Run configuration for the oxygen transport solver.

mod parameters;

pub use parameters::{Parameters, NECRO, NORMAL, PHASE_COUNT, TUMOR};

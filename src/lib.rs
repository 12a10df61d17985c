//! Oxynet - steady-state oxygen transport in vascularized tissue.
//!
//! Blood flows through a discrete vessel network, oxygen is carried by
//! hemoglobin and plasma, diffuses across vessel walls into a continuum
//! tissue field and is consumed by tissue metabolism. The solver computes a
//! self-consistent PO2 distribution over both the 1-D network and the 3-D
//! tissue grid by alternating blood-side integration and tissue-side
//! finite-volume solves under a damped fixed-point iteration.

// Allow non-snake-case for unit suffixes in field names (mmHg, um, etc.)
// This follows the project convention of including units in names.
#![allow(non_snake_case)]

pub mod blood;
pub mod config;
pub mod export;
pub mod fvm;
pub mod grid;
pub mod measurement;
pub mod mixing;
pub mod network;
pub mod propagation;
pub mod saturation;
pub mod solver;

pub use blood::TransportModel;
pub use config::Parameters;
pub use fvm::{BiCgStabSolver, LinearSolveError, StencilMatrix};
pub use grid::{LatticeGrid, ScalarField3, TissuePhases};
pub use measurement::{Measurement, VesselSampleRecord};
pub use network::{Vessel, VesselNetwork, VesselNode};
pub use propagation::PropagationModel;
pub use saturation::SaturationCurve;
pub use solver::{CancelToken, IterationRecord, OxygenTransportSolver, Po2Solution};

//! Parameter bundle for the coupled vessel/tissue PO2 computation.
//!
//! Loading is permissive: a missing or unparsable file falls back to
//! defaults, and individually invalid fields are reset to their defaults
//! with a logged warning instead of aborting the run. Fatal conditions are
//! reserved for structural invariants (see `network::topological_sort`).

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Tissue phase indices.
pub const NORMAL: usize = 0;
pub const TUMOR: usize = 1;
pub const NECRO: usize = 2;
/// Number of tissue composition phases.
pub const PHASE_COUNT: usize = 3;

/// Immutable configuration for a solver run.
///
/// Derived quantities (negligible-saturation threshold, saturation curvature
/// bound) live in [`crate::TransportModel`], which is rebuilt from this
/// bundle; they are recomputed whenever the parameters change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Hill exponent of the saturation curve
    pub sat_curve_exponent: f64,
    /// Half-saturation pressure (mmHg)
    pub sat_curve_p50_mmHg: f64,
    /// Outer iteration cap
    pub max_iter: usize,
    /// Axial step size in units of the lattice spacing
    pub axial_integration_step_factor: f64,
    /// Skip the tissue solve entirely (debugging aid)
    pub debug_zero_o2field: bool,

    /// Arterial inlet PO2 model: PInit(r) = min(cutoff, r0 + dr*r)
    pub po2init_r0_mmHg: f64,
    pub po2init_dr_mmHg_per_um: f64,
    pub po2init_cutoff_mmHg: f64,

    /// Ring width of the annular exchange model, in lattice spacings.
    /// Recognized for parameter-file compatibility; the diffusive wall-flux
    /// model does not read it.
    pub transvascular_ring_size: f64,

    /// Tissue boundary condition: 0 = Neumann (no-flux); otherwise a bitmask
    /// over faces (bit 0: -x, 1: +x, 2: -y, 3: +y, 4: -z, 5: +z) receiving
    /// the Dirichlet value below.
    pub tissue_boundary_condition_flags: u8,
    /// Dirichlet boundary PO2 (mmHg)
    pub tissue_boundary_value_mmHg: f64,

    /// Michaelis-Menten max consumption rate per phase (mlO2/ml/s)
    pub po2_mmcons_m0: [f64; PHASE_COUNT],
    /// Michaelis-Menten half-rate pressure per phase (mmHg)
    pub po2_mmcons_k_mmHg: [f64; PHASE_COUNT],
    /// Select Michaelis-Menten (true) or linear (false) tissue uptake
    pub michaelis_menten_uptake: bool,
    /// Linear consumption coefficient per phase (mlO2/ml/mmHg/s),
    /// used when `michaelis_menten_uptake` is false
    pub po2_cons_coeff: [f64; PHASE_COUNT],

    /// Plasma oxygen solubility (mlO2/cm^3/mmHg)
    pub plasma_solubility: f64,
    /// Tissue oxygen solubility (mlO2/cm^3/mmHg)
    pub tissue_solubility: f64,
    /// Oxygen binding capacity of fully saturated blood at h=1 (mlO2/cm^3)
    pub haemoglobin_binding_capacity: f64,
    /// Tissue oxygen diffusion constant (um^2/s)
    pub po2_kdiff_um2_per_s: f64,
    /// Plasma oxygen diffusion constant (um^2/s), used by the Nusselt-number
    /// wall conductance model
    pub D_plasma_um2_per_s: f64,

    /// Additional volume source terms in the tissue equation
    pub extra_tissue_source_linear: f64,
    pub extra_tissue_source_const: f64,

    /// Convergence tolerance on the max-norm deltas (mmHg)
    pub convergence_tolerance: f64,
    /// Bypass axial integration: vessel PO2 held constant along each segment
    pub approximate_insignificant_transvascular_flux: bool,

    /// Wall mass-transfer coefficient model: 0 = exponential decay,
    /// 1 = saturating Nusselt-number model
    pub mass_transfer_coefficient_model_number: u32,
    pub conductivity_coeff1: f64,
    pub conductivity_coeff2: f64,
    pub conductivity_coeff3: f64,

    /// Iteration cap of the inner tissue linear solver
    pub linear_solver_max_iterations: usize,
    /// Relative residual tolerance of the inner tissue linear solver
    pub linear_solver_tolerance: f64,

    /// Fractional share of the previous iterate kept by the damping update
    /// `new = (1-f)*computed + f*previous`
    pub damping_factor: f64,
    /// Reuse the tissue-solver preconditioner only after this many outer
    /// iterations ...
    pub precond_reuse_min_iteration: usize,
    /// ... and only while the previous solve needed fewer than this many
    /// inner iterations
    pub precond_reuse_max_solver_iterations: usize,

    /// 0 = quiet, 1 = per-iteration summary, 2 = verbose
    pub loglevel: i32,

    /// Directory for per-iteration debug snapshots; None disables export
    pub debug_snapshot_dir: Option<String>,
    /// Snapshot every n-th outer iteration
    pub debug_snapshot_cadence: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            sat_curve_exponent: 2.0,
            sat_curve_p50_mmHg: 38.0,
            max_iter: 100,
            axial_integration_step_factor: 0.5,
            debug_zero_o2field: false,
            po2init_r0_mmHg: 0.0,
            po2init_dr_mmHg_per_um: 0.0,
            po2init_cutoff_mmHg: 0.0,
            transvascular_ring_size: 0.5,
            tissue_boundary_condition_flags: 0, // neumann bc
            tissue_boundary_value_mmHg: 0.0,
            po2_mmcons_m0: [4.5 / 6.0e4, 4.5 / 6.0e4 * 2.0, 0.0],
            po2_mmcons_k_mmHg: [4.0, 2.0, 2.0],
            michaelis_menten_uptake: false,
            // default linear coefficients correspond to diffusion radii of
            // 200 / 100 / 500 um, see set_tissue_params_by_diffusion_radius
            po2_cons_coeff: [
                2000.0 / (200.0 * 200.0) * 2.8e-5,
                2000.0 / (100.0 * 100.0) * 2.8e-5,
                2000.0 / (500.0 * 500.0) * 2.8e-5,
            ],
            plasma_solubility: 3.1e-5,
            tissue_solubility: 2.8e-5,
            haemoglobin_binding_capacity: 0.5, // mlO2/cm^3
            po2_kdiff_um2_per_s: 2000.0,
            D_plasma_um2_per_s: 2000.0,
            extra_tissue_source_linear: 0.0,
            extra_tissue_source_const: 0.0,
            convergence_tolerance: 1.0e-3,
            approximate_insignificant_transvascular_flux: false,
            mass_transfer_coefficient_model_number: 0,
            conductivity_coeff1: 0.0, // must be set as a parameter, no physical default
            conductivity_coeff2: 0.0,
            conductivity_coeff3: 0.0,
            linear_solver_max_iterations: 500,
            linear_solver_tolerance: 1.0e-8,
            damping_factor: 0.3,
            precond_reuse_min_iteration: 2,
            precond_reuse_max_solver_iterations: 25,
            loglevel: 1,
            debug_snapshot_dir: None,
            debug_snapshot_cadence: 1,
        }
    }
}

impl Parameters {
    /// Load from a JSON file or return defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let mut params = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => match serde_json::from_str::<Parameters>(&contents) {
                Ok(params) => {
                    log::info!("Loaded solver parameters from {:?}", path.as_ref());
                    params
                }
                Err(e) => {
                    log::warn!("Failed to parse solver parameters: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                log::info!("Solver parameters file not found, using defaults");
                Self::default()
            }
        };
        params.validate();
        params
    }

    /// Reset individually invalid fields to defaults, with a logged warning.
    ///
    /// Policy: configuration errors never abort a run; the offending field
    /// reverts and the computation proceeds.
    pub fn validate(&mut self) {
        let defaults = Self::default();

        macro_rules! check_positive {
            ($field:ident) => {
                if !(self.$field > 0.0) || !self.$field.is_finite() {
                    log::warn!(
                        "invalid parameter {} = {}, reverting to {}",
                        stringify!($field),
                        self.$field,
                        defaults.$field
                    );
                    self.$field = defaults.$field;
                }
            };
        }
        macro_rules! check_non_negative {
            ($field:ident) => {
                if !(self.$field >= 0.0) || !self.$field.is_finite() {
                    log::warn!(
                        "invalid parameter {} = {}, reverting to {}",
                        stringify!($field),
                        self.$field,
                        defaults.$field
                    );
                    self.$field = defaults.$field;
                }
            };
        }

        check_positive!(sat_curve_exponent);
        check_positive!(sat_curve_p50_mmHg);
        check_positive!(axial_integration_step_factor);
        check_positive!(plasma_solubility);
        check_positive!(tissue_solubility);
        check_positive!(po2_kdiff_um2_per_s);
        check_positive!(D_plasma_um2_per_s);
        check_positive!(convergence_tolerance);
        check_positive!(linear_solver_tolerance);
        check_non_negative!(haemoglobin_binding_capacity);
        check_non_negative!(po2init_r0_mmHg);
        check_non_negative!(po2init_dr_mmHg_per_um);
        check_non_negative!(po2init_cutoff_mmHg);
        check_non_negative!(transvascular_ring_size);
        check_non_negative!(tissue_boundary_value_mmHg);

        for i in 0..PHASE_COUNT {
            if !(self.po2_mmcons_m0[i] >= 0.0) || !self.po2_mmcons_m0[i].is_finite() {
                log::warn!(
                    "invalid parameter po2_mmcons_m0[{}] = {}, reverting to {}",
                    i,
                    self.po2_mmcons_m0[i],
                    defaults.po2_mmcons_m0[i]
                );
                self.po2_mmcons_m0[i] = defaults.po2_mmcons_m0[i];
            }
            if !(self.po2_mmcons_k_mmHg[i] > 0.0) || !self.po2_mmcons_k_mmHg[i].is_finite() {
                log::warn!(
                    "invalid parameter po2_mmcons_k_mmHg[{}] = {}, reverting to {}",
                    i,
                    self.po2_mmcons_k_mmHg[i],
                    defaults.po2_mmcons_k_mmHg[i]
                );
                self.po2_mmcons_k_mmHg[i] = defaults.po2_mmcons_k_mmHg[i];
            }
            if !(self.po2_cons_coeff[i] >= 0.0) || !self.po2_cons_coeff[i].is_finite() {
                log::warn!(
                    "invalid parameter po2_cons_coeff[{}] = {}, reverting to {}",
                    i,
                    self.po2_cons_coeff[i],
                    defaults.po2_cons_coeff[i]
                );
                self.po2_cons_coeff[i] = defaults.po2_cons_coeff[i];
            }
        }

        if !(0.0..1.0).contains(&self.damping_factor) {
            log::warn!(
                "invalid parameter damping_factor = {}, reverting to {}",
                self.damping_factor,
                defaults.damping_factor
            );
            self.damping_factor = defaults.damping_factor;
        }
        if self.linear_solver_max_iterations == 0 {
            log::warn!(
                "linear_solver_max_iterations must be >= 1, reverting to {}",
                defaults.linear_solver_max_iterations
            );
            self.linear_solver_max_iterations = defaults.linear_solver_max_iterations;
        }
        if self.debug_snapshot_cadence == 0 {
            log::warn!("debug_snapshot_cadence must be >= 1, reverting to 1");
            self.debug_snapshot_cadence = 1;
        }
    }

    /// Arterial inlet PO2 as a function of vessel radius (mmHg).
    pub fn po2_init(&self, radius_um: f64) -> f64 {
        (self.po2init_r0_mmHg + self.po2init_dr_mmHg_per_um * radius_um)
            .min(self.po2init_cutoff_mmHg)
    }

    /// Derive linear consumption coefficients from per-phase diffusion radii.
    ///
    /// Sets `po2_cons_coeff[i] = kdiff / rdiff_i^2 * tissue_solubility` so
    /// that oxygen penetrates roughly `rdiff_i` um into each phase.
    pub fn set_tissue_params_by_diffusion_radius(
        &mut self,
        kdiff_um2_per_s: f64,
        tissue_solubility: f64,
        rdiff_normal_um: f64,
        rdiff_tumor_um: f64,
        rdiff_necro_um: f64,
    ) {
        self.po2_kdiff_um2_per_s = kdiff_um2_per_s;
        self.tissue_solubility = tissue_solubility;
        self.po2_cons_coeff[NORMAL] =
            kdiff_um2_per_s / (rdiff_normal_um * rdiff_normal_um) * tissue_solubility;
        self.po2_cons_coeff[TUMOR] =
            kdiff_um2_per_s / (rdiff_tumor_um * rdiff_tumor_um) * tissue_solubility;
        self.po2_cons_coeff[NECRO] =
            kdiff_um2_per_s / (rdiff_necro_um * rdiff_necro_um) * tissue_solubility;
    }
}

//! Blood and tissue oxygen flux model.
//!
//! Maps between oxygen partial pressure and volumetric concentration in
//! blood (hemoglobin-bound plus plasma-dissolved), evaluates tissue
//! consumption laws, and provides the transvascular mass-transfer
//! coefficient as a function of vessel radius.

use crate::config::{Parameters, PHASE_COUNT};
use crate::saturation::SaturationCurve;

/// Wall mass-transfer coefficient model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassTransferModel {
    /// K(r) = 2 pi r * (c1 + c3 * exp(-r/c2))
    ExponentialDecay,
    /// K(r) = pi * nu(r) * alpha_plasma * D_plasma
    /// with nu(r) = c2 * (1 - exp(-r/c1)) + c3 * r
    NusseltSaturating,
}

/// Cached transport coefficients derived from [`Parameters`].
///
/// Holds everything the blood-side and tissue-side computations need, plus
/// the derived values that must be recomputed whenever the parameters
/// change: the saturation curve (with its curvature bound) and the
/// negligible-saturation concentration threshold used by the inverse map.
#[derive(Debug, Clone)]
pub struct TransportModel {
    /// Oxygen-hemoglobin binding curve
    pub sat: SaturationCurve,
    /// Plasma solubility alpha_p (mlO2/cm^3/mmHg)
    pub plasma_solubility: f64,
    /// Tissue solubility alpha_t (mlO2/cm^3/mmHg)
    pub tissue_solubility: f64,
    /// Binding capacity c0 of fully saturated blood at h = 1 (mlO2/cm^3)
    pub haemoglobin_binding_capacity: f64,
    /// Tissue diffusion constant (um^2/s)
    pub po2_kdiff_um2_per_s: f64,
    d_plasma_um2_per_s: f64,
    michaelis_menten_uptake: bool,
    mm_m0: [f64; PHASE_COUNT],
    mm_k_mmHg: [f64; PHASE_COUNT],
    cons_coeff: [f64; PHASE_COUNT],
    mtc_model: MassTransferModel,
    conductivity_coeff1: f64,
    conductivity_coeff2: f64,
    conductivity_coeff3: f64,
    /// Below this concentration the saturation contribution is negligible
    /// and the inverse map uses the linear plasma relation directly
    conc_neglect: f64,
}

impl TransportModel {
    pub fn from_parameters(params: &Parameters) -> Self {
        let sat = SaturationCurve::new(params.sat_curve_exponent, params.sat_curve_p50_mmHg);

        // Find the pressure below which hemoglobin carries a negligible
        // share of the total concentration. Halving from p50 always
        // terminates for n > 1; the iteration cap covers degenerate curves.
        let mut p = params.sat_curve_p50_mmHg;
        for _ in 0..200 {
            let f = params.haemoglobin_binding_capacity * sat.saturation(p)
                / (params.plasma_solubility * p);
            if f < 1.0e-6 {
                break;
            }
            p *= 0.5;
        }
        let conc_neglect =
            params.haemoglobin_binding_capacity * sat.saturation(p) + params.plasma_solubility * p;

        let mtc_model = if params.mass_transfer_coefficient_model_number == 1 {
            MassTransferModel::NusseltSaturating
        } else {
            MassTransferModel::ExponentialDecay
        };

        Self {
            sat,
            plasma_solubility: params.plasma_solubility,
            tissue_solubility: params.tissue_solubility,
            haemoglobin_binding_capacity: params.haemoglobin_binding_capacity,
            po2_kdiff_um2_per_s: params.po2_kdiff_um2_per_s,
            d_plasma_um2_per_s: params.D_plasma_um2_per_s,
            michaelis_menten_uptake: params.michaelis_menten_uptake,
            mm_m0: params.po2_mmcons_m0,
            mm_k_mmHg: params.po2_mmcons_k_mmHg,
            cons_coeff: params.po2_cons_coeff,
            mtc_model,
            conductivity_coeff1: params.conductivity_coeff1,
            conductivity_coeff2: params.conductivity_coeff2,
            conductivity_coeff3: params.conductivity_coeff3,
            conc_neglect,
        }
    }

    /// Total blood oxygen concentration (mlO2/cm^3) at partial pressure `p`
    /// and hematocrit `h`: bound to hemoglobin plus dissolved in plasma.
    /// Monotonic increasing in p for h >= 0.
    pub fn conc_from_po2(&self, p: f64, h: f64) -> f64 {
        h * self.haemoglobin_binding_capacity * self.sat.saturation(p) + self.plasma_solubility * p
    }

    /// Invert [`Self::conc_from_po2`] for the partial pressure.
    ///
    /// The saturation curve is flat near zero, so for concentrations below
    /// the cached negligible-saturation threshold (or without red cells) the
    /// closed-form plasma relation is used directly. Otherwise the root is
    /// bracketed in `[0, 1.001*conc/alpha_p]`, narrowed by bisection and
    /// polished with bracket-bounded Newton steps.
    pub fn po2_from_conc(&self, conc: f64, h: f64) -> f64 {
        let a = h * self.haemoglobin_binding_capacity;
        let b = self.plasma_solubility;

        if conc < self.conc_neglect || h <= 0.0 {
            return conc / b;
        }

        let f = |p: f64| a * self.sat.saturation(p) + b * p - conc;

        let mut l = 0.0;
        let mut r = conc / b * 1.001;
        // precondition of the bracketing search; a violation indicates an
        // inconsistent parameter set
        debug_assert!(f(l) <= 0.0 && f(r) >= 0.0);

        while (r - l) > 0.001 * (r + l) {
            let mid = 0.5 * (l + r);
            if f(mid) <= 0.0 {
                l = mid;
            } else {
                r = mid;
            }
        }

        let mut x = 0.5 * (l + r);
        for _ in 0..10 {
            let (s, ds) = self.sat.diff_saturation(x);
            let fx = a * s + b * x - conc;
            let dfx = a * ds + b;
            let mut next = x - fx / dfx;
            if !(l..=r).contains(&next) {
                // never leave the bisection bracket
                next = if fx > 0.0 { 0.5 * (l + x) } else { 0.5 * (x + r) };
            }
            if fx > 0.0 {
                r = x;
            } else {
                l = x;
            }
            if (next - x).abs() <= 1.0e-12 * x.abs() {
                x = next;
                break;
            }
            x = next;
        }
        x
    }

    /// Tissue oxygen consumption rate and its derivative w.r.t. PO2, as a
    /// weighted sum over the local phase composition.
    ///
    /// Michaelis-Menten clamps the pressure to >= 0 for the rate evaluation
    /// so that negative excursions of the field cannot invert the sign of
    /// the consumption.
    pub fn compute_uptake(&self, po2: f64, phases: &[f64; PHASE_COUNT]) -> (f64, f64) {
        let mut m_total = 0.0;
        let mut dm_total = 0.0;
        if !self.michaelis_menten_uptake {
            for i in 0..PHASE_COUNT {
                dm_total += self.cons_coeff[i] * phases[i];
            }
            m_total = dm_total * po2;
        } else {
            let p = po2.max(0.0);
            for i in 0..PHASE_COUNT {
                let t1 = 1.0 / (p + self.mm_k_mmHg[i]);
                let m = self.mm_m0[i] * p * t1;
                let dm = self.mm_m0[i] * self.mm_k_mmHg[i] * t1 * t1;
                m_total += m * phases[i];
                dm_total += dm * phases[i];
            }
        }
        (m_total, dm_total)
    }

    /// Transvascular mass-transfer coefficient per unit vessel length
    /// (um^3 O2 / um / s / mmHg), i.e. 2 pi r times the wall MTC.
    pub fn wall_conductance(&self, radius_um: f64) -> f64 {
        match self.mtc_model {
            MassTransferModel::NusseltSaturating => {
                let p1 = self.conductivity_coeff1;
                let p2 = self.conductivity_coeff2;
                let p3 = self.conductivity_coeff3;
                let nusselt = p2 * (1.0 - (-radius_um / p1).exp()) + p3 * radius_um;
                let kd = self.plasma_solubility * self.d_plasma_um2_per_s;
                std::f64::consts::PI * nusselt * kd
            }
            MassTransferModel::ExponentialDecay => {
                let p0 = self.conductivity_coeff1;
                let p1 = self.conductivity_coeff2;
                let p2 = self.conductivity_coeff3;
                let p = p0 + (-radius_um / p1).exp() * p2;
                2.0 * std::f64::consts::PI * radius_um * p
            }
        }
    }
}

//! Validation tests for the blood-side oxygen transport model.
//!
//! Key validation targets:
//! - Hill curve: S(0) = 0, S(p50) = 0.5, monotone, bounded in [0,1)
//! - Concentration round-trip within 1e-3 relative tolerance
//! - Equilibration direction: flux leaves the blood while po2_blood >
//!   po2_tissue

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use oxynet::{
    LatticeGrid, Parameters, PropagationModel, SaturationCurve, ScalarField3, TransportModel,
    VesselNetwork,
};

fn transport_model() -> TransportModel {
    let mut params = Parameters::default();
    params.conductivity_coeff1 = 0.001;
    params.conductivity_coeff2 = 40.0;
    params.conductivity_coeff3 = 0.006;
    TransportModel::from_parameters(&params)
}

// ============================================================================
// Saturation Curve Tests
// ============================================================================

#[test]
fn test_saturation_monotone_and_bounded() {
    let curve = SaturationCurve::new(2.0, 38.0);
    assert_eq!(curve.saturation(0.0), 0.0);
    let mut last = 0.0;
    for i in 1..=2000 {
        let p = 0.25 * i as f64;
        let s = curve.saturation(p);
        assert!(s >= last, "saturation must be non-decreasing at p={}", p);
        assert!(s < 1.0, "saturation must stay below 1 at p={}", p);
        last = s;
    }
}

#[test]
fn test_saturation_half_at_p50() {
    let curve = SaturationCurve::new(2.0, 38.0);
    assert!(
        (curve.saturation(38.0) - 0.5).abs() < 1e-12,
        "saturation at p50 must be exactly one half"
    );
}

#[test]
fn test_negative_pressure_has_zero_saturation() {
    let curve = SaturationCurve::new(2.0, 38.0);
    let (s, ds, d2s) = curve.diff_saturation2(-10.0);
    assert_eq!((s, ds, d2s), (0.0, 0.0, 0.0));
}

// ============================================================================
// Concentration Round-Trip Tests
// ============================================================================

#[test]
fn test_po2_concentration_round_trip_sampled() {
    let model = transport_model();
    let mut rng = StdRng::seed_from_u64(0x6f78796e);
    for &h in &[0.1, 0.45, 0.9] {
        for _ in 0..500 {
            let p: f64 = rng.gen_range(0.0..5.0 * 38.0);
            let conc = model.conc_from_po2(p, h);
            let back = model.po2_from_conc(conc, h);
            let tol = 1.0e-3 * p.max(1.0e-6);
            assert!(
                (back - p).abs() <= tol,
                "round trip: p={:.6}, h={}, back={:.6}",
                p,
                h,
                back
            );
        }
    }
}

// ============================================================================
// Equilibration Direction Tests
// ============================================================================

#[test]
fn test_flux_positive_while_blood_above_tissue() {
    let model = transport_model();
    let grid = LatticeGrid::new([12, 5, 5], 30.0, DVec3::new(-30.0, -60.0, -60.0));
    let field = ScalarField3::filled(grid, 20.0);

    let mut net = VesselNetwork::new();
    let a = net.add_node(DVec3::new(0.0, 0.0, 0.0), 100.0, true);
    let b = net.add_node(DVec3::new(300.0, 0.0, 0.0), 40.0, true);
    let v = net.add_vessel(a, b, 5.0, 500.0, 0.45, true);

    let mut flux_signs_checked = 0;
    let end = oxynet::propagation::integrate_vessel_po2(
        &model,
        PropagationModel::ImplicitEuler,
        &net,
        &field,
        v,
        a,
        80.0,
        0.5,
        &mut |_, _, _, _, po2, flux| {
            if po2 > flux.po2_tissue {
                assert!(
                    flux.flux(po2) > 0.0,
                    "flux must leave the blood while po2_blood > po2_tissue"
                );
                flux_signs_checked += 1;
            }
        },
    );
    assert!(flux_signs_checked > 0);
    assert!(
        end < 80.0 && end >= 20.0,
        "outlet must trend toward the 20 mmHg tissue level, got {}",
        end
    );
}

//! Oxygen mixing where blood streams merge at network nodes.
//!
//! Mass conservation over all inflows of a node: total blood flow, red
//! cell flow and oxygen flux are summed, and the mixed outflow PO2 is
//! recovered from the effective concentration and effective hematocrit.
//! All outflow vessels leave the node with this single PO2.

use crate::blood::TransportModel;
use crate::network::{NodeIndex, Vessel, VesselNetwork};

/// Per-vessel PO2 endpoints, indexed `[vessel][side]` with side 0 at
/// `node_a` and side 1 at `node_b`. Initialized to NaN so that a read of a
/// never-written entry is loud in debug builds.
pub type VesselPo2Storage = Vec<[f64; 2]>;

/// Side of `vessel` adjacent to `node`.
#[inline]
pub fn side_index(vessel: &Vessel, node: NodeIndex) -> usize {
    if vessel.node_a == node {
        0
    } else {
        1
    }
}

/// Mix the inflows of `node` and write the resulting PO2 to the node-side
/// endpoint of every circulated outflow vessel.
///
/// Inflow and outflow are classified by strict pressure comparison against
/// the neighbor node; equal-pressure neighbors contribute to neither side.
/// A node without inflow (or without blood flow) emits PO2 = 0.
pub fn mix_node_outflow_po2(
    network: &VesselNetwork,
    node: NodeIndex,
    model: &TransportModel,
    vesselpo2: &mut VesselPo2Storage,
) {
    let press = network.node(node).press;

    let mut qblood = 0.0;
    let mut qrbc = 0.0;
    let mut mo2flux = 0.0;

    for &e in network.node(node).edges() {
        let vessel = network.vessel(e);
        if !vessel.circulated {
            continue;
        }
        let neighbor = network.other_end(e, node);
        if network.node(neighbor).press <= press {
            continue;
        }
        let po2_vess = vesselpo2[e][side_index(vessel, node)];
        debug_assert!(po2_vess.is_finite(), "inflow vessel {} not yet integrated", e);
        let q = vessel.flow_rate;
        let h = vessel.hematocrit;
        qblood += q;
        qrbc += h * q;
        mo2flux += model.conc_from_po2(po2_vess, h) * q;
    }

    let po2 = if qblood > 0.0 {
        let heff = qrbc / qblood;
        let ceff = mo2flux / qblood;
        let po2 = model.po2_from_conc(ceff, heff);
        debug_assert!(po2 <= 1000.0);
        po2
    } else {
        0.0
    };

    for &e in network.node(node).edges() {
        let vessel = network.vessel(e);
        if !vessel.circulated {
            continue;
        }
        let neighbor = network.other_end(e, node);
        if network.node(neighbor).press >= press {
            continue;
        }
        vesselpo2[e][side_index(vessel, node)] = po2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameters;
    use glam::DVec3;

    /// Two vessels merging into one: in0, in1 -> junction -> out.
    fn confluence(q0: f64, q1: f64, h0: f64, h1: f64) -> (VesselNetwork, NodeIndex) {
        let mut net = VesselNetwork::new();
        let in0 = net.add_node(DVec3::new(-100.0, 50.0, 0.0), 90.0, true);
        let in1 = net.add_node(DVec3::new(-100.0, -50.0, 0.0), 90.0, true);
        let junction = net.add_node(DVec3::ZERO, 70.0, false);
        let out = net.add_node(DVec3::new(100.0, 0.0, 0.0), 40.0, true);
        net.add_vessel(in0, junction, 5.0, q0, h0, true);
        net.add_vessel(in1, junction, 5.0, q1, h1, true);
        net.add_vessel(junction, out, 7.0, q0 + q1, (h0 * q0 + h1 * q1) / (q0 + q1), true);
        (net, junction)
    }

    #[test]
    fn test_equal_streams_average_concentration() {
        let model = TransportModel::from_parameters(&Parameters::default());
        let (net, junction) = confluence(1000.0, 1000.0, 0.45, 0.45);
        let mut po2 = vec![[f64::NAN; 2]; net.vessel_count()];
        po2[0][1] = 80.0;
        po2[1][1] = 40.0;
        mix_node_outflow_po2(&net, junction, &model, &mut po2);
        let mixed = po2[2][0];
        assert!(mixed > 40.0 && mixed < 80.0, "mixed po2 = {}", mixed);
        // hemoglobin nonlinearity pulls the mixed po2 below the arithmetic
        // pressure mean
        assert!(mixed < 60.0);
        // oxygen flux in == oxygen flux out
        let flux_in =
            model.conc_from_po2(80.0, 0.45) * 1000.0 + model.conc_from_po2(40.0, 0.45) * 1000.0;
        let flux_out = model.conc_from_po2(mixed, 0.45) * 2000.0;
        assert!(
            (flux_in - flux_out).abs() < 1.0e-3 * flux_in,
            "O2 flux not conserved: {} vs {}",
            flux_in,
            flux_out
        );
    }

    #[test]
    fn test_unequal_flows_weight_the_mix() {
        let model = TransportModel::from_parameters(&Parameters::default());
        let (net, junction) = confluence(1900.0, 100.0, 0.45, 0.45);
        let mut po2 = vec![[f64::NAN; 2]; net.vessel_count()];
        po2[0][1] = 80.0;
        po2[1][1] = 40.0;
        mix_node_outflow_po2(&net, junction, &model, &mut po2);
        assert!(po2[2][0] > 70.0, "dominant stream must dominate: {}", po2[2][0]);
    }

    #[test]
    fn test_no_inflow_emits_zero() {
        let model = TransportModel::from_parameters(&Parameters::default());
        let mut net = VesselNetwork::new();
        let top = net.add_node(DVec3::ZERO, 50.0, true);
        let bottom = net.add_node(DVec3::new(100.0, 0.0, 0.0), 20.0, true);
        net.add_vessel(top, bottom, 5.0, 500.0, 0.45, true);
        let mut po2 = vec![[f64::NAN; 2]; 1];
        mix_node_outflow_po2(&net, top, &model, &mut po2);
        assert_eq!(po2[0][0], 0.0);
    }

    #[test]
    fn test_non_circulated_inflow_ignored() {
        let model = TransportModel::from_parameters(&Parameters::default());
        let (mut net, junction) = confluence(1000.0, 1000.0, 0.45, 0.45);
        let extra = net.add_node(DVec3::new(0.0, 100.0, 0.0), 95.0, true);
        net.add_vessel(extra, junction, 3.0, 0.0, 0.0, false);
        let mut po2 = vec![[f64::NAN; 2]; net.vessel_count()];
        po2[0][1] = 60.0;
        po2[1][1] = 60.0;
        mix_node_outflow_po2(&net, junction, &model, &mut po2);
        assert!((po2[2][0] - 60.0).abs() < 1.0e-3 * 60.0);
    }
}

//! JSON snapshots of the solver state.
//!
//! Two exports share the same vessel serialization: per-iteration debug
//! snapshots (including the assembled matrix diagnostics) written from
//! inside the outer loop, and the final solution export.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use serde::Serialize;

use crate::fvm::StencilMatrix;
use crate::grid::ScalarField3;
use crate::network::{VesselIndex, VesselNetwork};
use crate::solver::{IterationRecord, Po2Solution};

const EXPORT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize)]
struct VesselExport {
    index: usize,
    node_a: usize,
    node_b: usize,
    radius_um: f64,
    flow_rate: f64,
    hematocrit: f64,
    circulated: bool,
    press_a_mmHg: f64,
    press_b_mmHg: f64,
    /// Rank in the traversal order
    topo_order: usize,
    /// Mean of the endpoint PO2 values, -1 when never computed
    avg_po2_mmHg: f64,
}

#[derive(Debug, Clone, Serialize)]
struct FieldExport<'a> {
    dims: [usize; 3],
    spacing_um: f64,
    origin_um: [f64; 3],
    values: &'a [f64],
}

#[derive(Debug, Clone, Serialize)]
struct MatrixExport<'a> {
    diag: &'a [f64],
    rhs: &'a [f64],
    /// Per-row coefficient sums; zero in the interior of a pure diffusion
    /// operator, so deviations localize the source and sink terms
    rowsum: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct DebugSnapshot<'a> {
    exported_at: String,
    version: &'static str,
    iteration: usize,
    vessels: Vec<VesselExport>,
    field: FieldExport<'a>,
    matrix: MatrixExport<'a>,
}

#[derive(Debug, Clone, Serialize)]
struct SolutionExport<'a> {
    exported_at: String,
    version: &'static str,
    vessels: Vec<VesselExport>,
    vessel_po2_mmHg: &'a [[f64; 2]],
    field: FieldExport<'a>,
    iterations: &'a [IterationRecord],
}

fn export_vessels(
    network: &VesselNetwork,
    sorted_vessels: &[VesselIndex],
    vesselpo2: &[[f64; 2]],
) -> Vec<VesselExport> {
    let mut topo_rank = vec![0usize; network.vessel_count()];
    for (rank, &v) in sorted_vessels.iter().enumerate() {
        topo_rank[v] = rank;
    }
    network
        .vessels()
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let avg = 0.5 * (vesselpo2[i][0] + vesselpo2[i][1]);
            VesselExport {
                index: i,
                node_a: v.node_a,
                node_b: v.node_b,
                radius_um: v.radius_um,
                flow_rate: v.flow_rate,
                hematocrit: v.hematocrit,
                circulated: v.circulated,
                press_a_mmHg: network.node(v.node_a).press,
                press_b_mmHg: network.node(v.node_b).press,
                topo_order: topo_rank[i],
                avg_po2_mmHg: if avg.is_finite() { avg } else { -1.0 },
            }
        })
        .collect()
}

fn export_field(field: &ScalarField3) -> FieldExport<'_> {
    let grid = field.grid();
    FieldExport {
        dims: grid.dims,
        spacing_um: grid.spacing_um,
        origin_um: [grid.origin.x, grid.origin.y, grid.origin.z],
        values: field.values(),
    }
}

/// Write a per-iteration debug snapshot `po2_iter_NNNN.json` into `dir`,
/// creating the directory if needed. Returns the path of the written file.
pub fn write_debug_snapshot(
    dir: &str,
    iteration: usize,
    network: &VesselNetwork,
    sorted_vessels: &[VesselIndex],
    vesselpo2: &[[f64; 2]],
    field: &ScalarField3,
    matrix: &StencilMatrix,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = Path::new(dir).join(format!("po2_iter_{:04}.json", iteration));

    let snapshot = DebugSnapshot {
        exported_at: Local::now().to_rfc3339(),
        version: EXPORT_VERSION,
        iteration,
        vessels: export_vessels(network, sorted_vessels, vesselpo2),
        field: export_field(field),
        matrix: MatrixExport {
            diag: &matrix.diag,
            rhs: &matrix.rhs,
            rowsum: (0..matrix.len()).map(|s| matrix.row_sum(s)).collect(),
        },
    };

    let file = std::fs::File::create(&path)?;
    serde_json::to_writer(file, &snapshot)?;
    log::debug!("debug snapshot written: {}", path.display());
    Ok(path)
}

/// Export a converged solution to a JSON file.
pub fn write_solution_json<P: AsRef<Path>>(
    path: P,
    network: &VesselNetwork,
    solution: &Po2Solution,
) -> Result<()> {
    let export = SolutionExport {
        exported_at: Local::now().to_rfc3339(),
        version: EXPORT_VERSION,
        vessels: export_vessels(network, &solution.sorted_vessels, &solution.vessel_po2),
        vessel_po2_mmHg: &solution.vessel_po2,
        field: export_field(&solution.po2field),
        iterations: &solution.iterations,
    };

    let file = std::fs::File::create(path.as_ref())?;
    serde_json::to_writer_pretty(file, &export)?;
    log::info!("solution exported: {}", path.as_ref().display());
    Ok(())
}

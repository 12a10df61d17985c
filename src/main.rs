//! Oxynet - entry point
//!
//! Runs the coupled vessel/tissue PO2 solver on a demo network and prints
//! a summary, optionally exporting the solution as JSON.
//!
//! CLI Usage:
//!   cargo run                          # Demo bifurcation network
//!   cargo run -- -p params.json        # Load solver parameters from file
//!   cargo run -- -o solution.json      # Export the converged solution
//!   cargo run -- --bypass              # Constant-PO2 propagation

use anyhow::Result;
use glam::DVec3;
use oxynet::export::write_solution_json;
use oxynet::solver::CancelToken;
use oxynet::{
    LatticeGrid, Measurement, OxygenTransportSolver, Parameters, TissuePhases, VesselNetwork,
};

/// Symmetric bifurcation tree: one feeding artery splitting into two
/// branches that drain into boundary outlets.
fn build_demo_network() -> VesselNetwork {
    let mut net = VesselNetwork::new();
    let root = net.add_node(DVec3::new(0.0, 0.0, 0.0), 100.0, true);
    let fork = net.add_node(DVec3::new(300.0, 0.0, 0.0), 80.0, false);
    let out_a = net.add_node(DVec3::new(600.0, 150.0, 0.0), 40.0, true);
    let out_b = net.add_node(DVec3::new(600.0, -150.0, 0.0), 40.0, true);
    net.add_vessel(root, fork, 12.0, 2.0e4, 0.45, true);
    net.add_vessel(fork, out_a, 8.0, 1.0e4, 0.45, true);
    net.add_vessel(fork, out_b, 8.0, 1.0e4, 0.45, true);
    net
}

fn demo_parameters(path: Option<&str>) -> Parameters {
    let mut params = match path {
        Some(p) => Parameters::load_or_default(p),
        None => Parameters::default(),
    };
    if params.po2init_cutoff_mmHg <= 0.0 {
        // inlet model for the demo: 30 mmHg base plus 1 mmHg per um of
        // radius, capped at arterial levels
        params.po2init_r0_mmHg = 30.0;
        params.po2init_dr_mmHg_per_um = 1.0;
        params.po2init_cutoff_mmHg = 80.0;
    }
    if params.conductivity_coeff1 <= 0.0 && params.conductivity_coeff3 <= 0.0 {
        params.conductivity_coeff1 = 0.001;
        params.conductivity_coeff2 = 40.0;
        params.conductivity_coeff3 = 0.006;
    }
    params
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut params_path: Option<String> = None;
    let mut output_path: Option<String> = None;
    let mut bypass = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--params" if i + 1 < args.len() => {
                params_path = Some(args[i + 1].clone());
                i += 1;
            }
            "-o" | "--output" if i + 1 < args.len() => {
                output_path = Some(args[i + 1].clone());
                i += 1;
            }
            "--bypass" => bypass = true,
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: oxynet [-p params.json] [-o solution.json] [--bypass]");
                std::process::exit(2);
            }
        }
        i += 1;
    }

    println!("=== Oxynet - Vessel/Tissue PO2 Transport ===\n");

    let mut params = demo_parameters(params_path.as_deref());
    params.approximate_insignificant_transvascular_flux |= bypass;

    let network = build_demo_network();
    let grid = LatticeGrid::new([24, 16, 8], 30.0, DVec3::new(-45.0, -225.0, -105.0));
    let phases = TissuePhases::uniform_normal(grid);

    println!("Vessels: {}", network.vessel_count());
    println!("Nodes: {}", network.node_count());
    println!(
        "Lattice: {}x{}x{} @ {} um",
        grid.dims[0], grid.dims[1], grid.dims[2], grid.spacing_um
    );

    let solver = OxygenTransportSolver::new(params);
    let solution = solver.run(&network, &grid, &phases, &CancelToken::new())?;

    println!("\nConverged after {} iterations", solution.iterations.len());
    if let Some(last) = solution.iterations.last() {
        println!(
            "Final deltas: vessels {:.2e} mmHg, field {:.2e} mmHg",
            last.delta_vessM, last.delta_fieldM
        );
    }

    for (i, po2) in solution.vessel_po2.iter().enumerate() {
        println!(
            "Vessel {}: po2 {:.2} -> {:.2} mmHg",
            i, po2[0], po2[1]
        );
    }

    let field_max = solution
        .po2field
        .values()
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    let field_mean =
        solution.po2field.values().iter().sum::<f64>() / solution.po2field.values().len() as f64;
    println!("Tissue PO2: mean {:.2} mmHg, max {:.2} mmHg", field_mean, field_max);

    let mut measurement = Measurement::new(&solver, &network, &solution);
    for i in 0..network.vessel_count() {
        measurement.vessel_solution(i);
    }
    println!(
        "O2 mass flux: in {:.4e}, out {:.4e}, transvascular {:.4e} um^3/s",
        measurement.o2mass_in_root, measurement.o2mass_out_root, measurement.o2mass_out_vessels
    );

    if let Some(path) = output_path {
        write_solution_json(&path, &network, &solution)?;
        println!("Solution written to {}", path);
    }

    Ok(())
}

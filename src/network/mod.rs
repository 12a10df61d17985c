//! Vessel network arena and flow-direction topology.
//!
//! Nodes and vessels live in index-addressed arenas with adjacency stored
//! as index lists, which keeps the bidirectional node/edge references free
//! of ownership cycles. Geometry, pressures, flow rates and hematocrit are
//! supplied by the upstream flow solver; this crate only reads them.

use anyhow::{bail, Result};
use glam::DVec3;

pub type NodeIndex = usize;
pub type VesselIndex = usize;

/// Junction of the vascular network.
#[derive(Debug, Clone)]
pub struct VesselNode {
    /// World position (um)
    pub worldpos: DVec3,
    /// Blood pressure at this node (supplied externally); flow on each
    /// vessel runs from its higher-pressure endpoint to the lower one
    pub press: f64,
    /// Boundary nodes are candidates for arterial inflow roots
    pub boundary: bool,
    edges: Vec<VesselIndex>,
}

impl VesselNode {
    /// Indices of vessels incident to this node.
    pub fn edges(&self) -> &[VesselIndex] {
        &self.edges
    }
}

/// Vessel segment between two nodes.
#[derive(Debug, Clone)]
pub struct Vessel {
    pub node_a: NodeIndex,
    pub node_b: NodeIndex,
    pub radius_um: f64,
    /// Volumetric blood flow rate (um^3/s)
    pub flow_rate: f64,
    /// Volume fraction of red blood cells
    pub hematocrit: f64,
    /// Carries validated nonzero flow; non-perfused vessels are skipped by
    /// the transport computation and pinned to PO2 = 0
    pub circulated: bool,
}

/// Directed multigraph of vessels, addressed by stable integer indices.
#[derive(Debug, Clone, Default)]
pub struct VesselNetwork {
    nodes: Vec<VesselNode>,
    vessels: Vec<Vessel>,
}

impl VesselNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, worldpos: DVec3, press: f64, boundary: bool) -> NodeIndex {
        self.nodes.push(VesselNode {
            worldpos,
            press,
            boundary,
            edges: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn add_vessel(
        &mut self,
        node_a: NodeIndex,
        node_b: NodeIndex,
        radius_um: f64,
        flow_rate: f64,
        hematocrit: f64,
        circulated: bool,
    ) -> VesselIndex {
        let idx = self.vessels.len();
        self.vessels.push(Vessel {
            node_a,
            node_b,
            radius_um,
            flow_rate,
            hematocrit,
            circulated,
        });
        self.nodes[node_a].edges.push(idx);
        self.nodes[node_b].edges.push(idx);
        idx
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn vessel_count(&self) -> usize {
        self.vessels.len()
    }

    pub fn node(&self, i: NodeIndex) -> &VesselNode {
        &self.nodes[i]
    }

    pub fn vessel(&self, i: VesselIndex) -> &Vessel {
        &self.vessels[i]
    }

    pub fn vessels(&self) -> &[Vessel] {
        &self.vessels
    }

    /// The endpoint of vessel `v` that is not `n`.
    pub fn other_end(&self, v: VesselIndex, n: NodeIndex) -> NodeIndex {
        let vessel = &self.vessels[v];
        if vessel.node_a == n {
            vessel.node_b
        } else {
            vessel.node_a
        }
    }

    /// Higher-pressure endpoint of a vessel. Equal pressures resolve to the
    /// A side, matching the strict-inequality test on the B side.
    pub fn upstream_node(&self, v: VesselIndex) -> NodeIndex {
        let vessel = &self.vessels[v];
        if self.nodes[vessel.node_b].press > self.nodes[vessel.node_a].press {
            vessel.node_b
        } else {
            vessel.node_a
        }
    }

    pub fn downstream_node(&self, v: VesselIndex) -> NodeIndex {
        self.other_end(v, self.upstream_node(v))
    }

    /// Start point, unit direction and length of a vessel, oriented away
    /// from the given start node.
    pub fn segment_line(&self, v: VesselIndex, start: NodeIndex) -> (DVec3, DVec3, f64) {
        let vessel = &self.vessels[v];
        let (p0, p1) = if start == vessel.node_a {
            (self.nodes[vessel.node_a].worldpos, self.nodes[vessel.node_b].worldpos)
        } else {
            (self.nodes[vessel.node_b].worldpos, self.nodes[vessel.node_a].worldpos)
        };
        let dp = p1 - p0;
        let len = dp.length();
        (p0, dp / len, len)
    }

    /// Order all vessels so that every circulated vessel appears after the
    /// circulated vessels feeding its upstream node.
    ///
    /// Kahn's algorithm over the flow-direction DAG. A cycle in the flow
    /// directions is physically invalid (it would mean pressure decreases
    /// around a loop) and indicates an upstream flow-solver error, so it is
    /// a fatal failure rather than something to skip over.
    /// Non-circulated vessels are appended at the end in index order.
    pub fn topological_sort(&self) -> Result<Vec<VesselIndex>> {
        let n_vessels = self.vessels.len();
        let mut indegree = vec![0usize; n_vessels];
        let mut n_circulated = 0usize;

        for (i, v) in self.vessels.iter().enumerate() {
            if !v.circulated {
                continue;
            }
            n_circulated += 1;
            let upstream = self.upstream_node(i);
            for &e in self.nodes[upstream].edges.iter() {
                if e == i || !self.vessels[e].circulated {
                    continue;
                }
                if self.downstream_node(e) == upstream {
                    indegree[i] += 1;
                }
            }
        }

        let mut queue: Vec<VesselIndex> = (0..n_vessels)
            .filter(|&i| self.vessels[i].circulated && indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(n_vessels);

        while let Some(v) = queue.pop() {
            order.push(v);
            let down = self.downstream_node(v);
            for &e in self.nodes[down].edges.iter() {
                if e == v || !self.vessels[e].circulated {
                    continue;
                }
                if self.upstream_node(e) == down {
                    indegree[e] -= 1;
                    if indegree[e] == 0 {
                        queue.push(e);
                    }
                }
            }
        }

        if order.len() != n_circulated {
            bail!(
                "cyclic flow directions in vessel network: {} of {} circulated vessels unsortable",
                n_circulated - order.len(),
                n_circulated
            );
        }

        order.extend((0..n_vessels).filter(|&i| !self.vessels[i].circulated));
        Ok(order)
    }

    /// Boundary nodes that act as the upstream end of at least one
    /// circulated vessel.
    pub fn arterial_roots(&self) -> Vec<NodeIndex> {
        let mut roots = Vec::new();
        for (i, v) in self.vessels.iter().enumerate() {
            if !v.circulated {
                continue;
            }
            let upstream = self.upstream_node(i);
            for n in [v.node_a, v.node_b] {
                if n == upstream && self.nodes[n].boundary && !roots.contains(&n) {
                    roots.push(n);
                }
            }
        }
        roots
    }
}

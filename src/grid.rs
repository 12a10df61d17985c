//! Regular 3-D lattice, scalar fields and tissue composition.

use glam::DVec3;

use crate::config::PHASE_COUNT;

/// Uniform cubic lattice covering the tissue domain.
///
/// Lattice point `(ix, iy, iz)` sits at `origin + spacing * (ix, iy, iz)`;
/// data indices run x-fastest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeGrid {
    pub dims: [usize; 3],
    pub spacing_um: f64,
    pub origin: DVec3,
}

impl LatticeGrid {
    pub fn new(dims: [usize; 3], spacing_um: f64, origin: DVec3) -> Self {
        Self {
            dims,
            spacing_um,
            origin,
        }
    }

    /// Number of lattice points.
    pub fn len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat site index of a lattice point.
    #[inline]
    pub fn site(&self, ix: usize, iy: usize, iz: usize) -> usize {
        (iz * self.dims[1] + iy) * self.dims[0] + ix
    }

    /// Inverse of [`Self::site`].
    #[inline]
    pub fn point_of_site(&self, site: usize) -> [usize; 3] {
        let ix = site % self.dims[0];
        let iy = (site / self.dims[0]) % self.dims[1];
        let iz = site / (self.dims[0] * self.dims[1]);
        [ix, iy, iz]
    }

    #[inline]
    pub fn contains(&self, p: [i64; 3]) -> bool {
        (0..3).all(|i| p[i] >= 0 && (p[i] as usize) < self.dims[i])
    }

    /// World position of a lattice point.
    pub fn lattice_to_world(&self, p: [usize; 3]) -> DVec3 {
        self.origin + self.spacing_um * DVec3::new(p[0] as f64, p[1] as f64, p[2] as f64)
    }

    /// Split a world position into the lower lattice cell corner and the
    /// fractional offset within that cell (each component in [0,1) when the
    /// position is inside the lattice).
    pub fn world_to_fractional(&self, wp: DVec3) -> ([i64; 3], [f64; 3]) {
        let rel = (wp - self.origin) / self.spacing_um;
        let mut ip = [0i64; 3];
        let mut q = [0.0; 3];
        for i in 0..3 {
            let f = rel[i].floor();
            ip[i] = f as i64;
            q[i] = rel[i] - f;
        }
        (ip, q)
    }
}

/// Scalar field over a [`LatticeGrid`], stored as a flat vector.
#[derive(Debug, Clone)]
pub struct ScalarField3 {
    grid: LatticeGrid,
    data: Vec<f64>,
}

impl ScalarField3 {
    pub fn filled(grid: LatticeGrid, value: f64) -> Self {
        Self {
            data: vec![value; grid.len()],
            grid,
        }
    }

    pub fn grid(&self) -> &LatticeGrid {
        &self.grid
    }

    #[inline]
    pub fn get(&self, site: usize) -> f64 {
        self.data[site]
    }

    #[inline]
    pub fn set(&mut self, site: usize, value: f64) {
        self.data[site] = value;
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    /// Tri-linear interpolation at a world position.
    ///
    /// Positions outside the lattice are clamped to the boundary cell, so
    /// vessel sample points sitting on or marginally beyond the domain edge
    /// evaluate to the nearest boundary value.
    pub fn interpolate(&self, wp: DVec3) -> f64 {
        let (ip, q) = self.grid.world_to_fractional(wp);

        let mut base = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for i in 0..3 {
            let hi = self.grid.dims[i] as i64 - 1;
            if ip[i] < 0 {
                base[i] = 0;
                frac[i] = 0.0;
            } else if ip[i] >= hi {
                base[i] = (hi - 1).max(0) as usize;
                frac[i] = 1.0;
            } else {
                base[i] = ip[i] as usize;
                frac[i] = q[i];
            }
        }
        // degenerate single-layer dimensions collapse to constant
        for i in 0..3 {
            if self.grid.dims[i] == 1 {
                base[i] = 0;
                frac[i] = 0.0;
            }
        }

        let mut result = 0.0;
        for corner in 0..8usize {
            let dx = corner & 1;
            let dy = (corner >> 1) & 1;
            let dz = (corner >> 2) & 1;
            let w = (if dx == 1 { frac[0] } else { 1.0 - frac[0] })
                * (if dy == 1 { frac[1] } else { 1.0 - frac[1] })
                * (if dz == 1 { frac[2] } else { 1.0 - frac[2] });
            if w == 0.0 {
                continue;
            }
            let ix = (base[0] + dx).min(self.grid.dims[0] - 1);
            let iy = (base[1] + dy).min(self.grid.dims[1] - 1);
            let iz = (base[2] + dz).min(self.grid.dims[2] - 1);
            result += w * self.data[self.grid.site(ix, iy, iz)];
        }
        result
    }
}

/// Per-lattice-point fractional tissue composition (normal/tumor/necrotic).
#[derive(Debug, Clone)]
pub struct TissuePhases {
    grid: LatticeGrid,
    data: Vec<[f64; PHASE_COUNT]>,
}

impl TissuePhases {
    /// All-normal tissue.
    pub fn uniform_normal(grid: LatticeGrid) -> Self {
        Self {
            data: vec![[1.0, 0.0, 0.0]; grid.len()],
            grid,
        }
    }

    pub fn from_fractions(grid: LatticeGrid, data: Vec<[f64; PHASE_COUNT]>) -> Self {
        assert_eq!(data.len(), grid.len());
        Self { grid, data }
    }

    pub fn grid(&self) -> &LatticeGrid {
        &self.grid
    }

    #[inline]
    pub fn at(&self, site: usize) -> &[f64; PHASE_COUNT] {
        &self.data[site]
    }

    pub fn at_mut(&mut self, site: usize) -> &mut [f64; PHASE_COUNT] {
        &mut self.data[site]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> LatticeGrid {
        LatticeGrid::new([4, 3, 2], 10.0, DVec3::ZERO)
    }

    #[test]
    fn test_site_round_trip() {
        let g = grid();
        for iz in 0..2 {
            for iy in 0..3 {
                for ix in 0..4 {
                    let s = g.site(ix, iy, iz);
                    assert_eq!(g.point_of_site(s), [ix, iy, iz]);
                }
            }
        }
    }

    #[test]
    fn test_interpolation_exact_at_lattice_points() {
        let g = grid();
        let mut f = ScalarField3::filled(g, 0.0);
        for s in 0..g.len() {
            f.set(s, s as f64);
        }
        for iz in 0..2 {
            for iy in 0..3 {
                for ix in 0..4 {
                    let wp = g.lattice_to_world([ix, iy, iz]);
                    let v = f.interpolate(wp);
                    assert!(
                        (v - g.site(ix, iy, iz) as f64).abs() < 1e-9,
                        "interpolation at lattice point ({},{},{}) = {}",
                        ix,
                        iy,
                        iz,
                        v
                    );
                }
            }
        }
    }

    #[test]
    fn test_interpolation_linear_between_points() {
        let g = LatticeGrid::new([2, 1, 1], 10.0, DVec3::ZERO);
        let mut f = ScalarField3::filled(g, 0.0);
        f.set(1, 100.0);
        let v = f.interpolate(DVec3::new(2.5, 0.0, 0.0));
        assert!((v - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation_clamps_outside() {
        let g = grid();
        let mut f = ScalarField3::filled(g, 3.0);
        f.set(0, 7.0);
        let v = f.interpolate(DVec3::new(-100.0, -100.0, -100.0));
        assert!((v - 7.0).abs() < 1e-9);
    }
}

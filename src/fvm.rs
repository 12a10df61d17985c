//! Finite-volume matrix builder and iterative linear solver.
//!
//! The tissue diffusion-consumption equation is discretized on the lattice
//! with a 7-point stencil. The matrix is stored structurally: one diagonal
//! coefficient and six face coefficients per lattice point, plus the right
//! hand side. The builder is zeroed and refilled every outer iteration.
//!
//! The solve uses Jacobi-preconditioned BiCGStab. Dirichlet rows make the
//! system mildly nonsymmetric, which rules out plain CG. The preconditioner
//! (the cached inverse diagonal) can be kept across solves; the outer
//! controller retries a failed solve once with a rebuilt preconditioner
//! before giving up.

use rayon::prelude::*;

use crate::grid::LatticeGrid;

/// Face order: -x, +x, -y, +y, -z, +z.
const FACE_COUNT: usize = 6;

#[inline]
fn face_neighbor(dims: &[usize; 3], site: usize, face: usize) -> Option<usize> {
    let nx = dims[0];
    let ny = dims[1];
    let ix = site % nx;
    let iy = (site / nx) % ny;
    let iz = site / (nx * ny);
    match face {
        0 if ix > 0 => Some(site - 1),
        1 if ix + 1 < nx => Some(site + 1),
        2 if iy > 0 => Some(site - nx),
        3 if iy + 1 < ny => Some(site + nx),
        4 if iz > 0 => Some(site - nx * ny),
        5 if iz + 1 < dims[2] => Some(site + nx * ny),
        _ => None,
    }
}

/// Sparse system A x = rhs over a lattice, 7-point structure.
#[derive(Debug, Clone)]
pub struct StencilMatrix {
    dims: [usize; 3],
    spacing_um: f64,
    pub diag: Vec<f64>,
    off: [Vec<f64>; FACE_COUNT],
    pub rhs: Vec<f64>,
}

impl StencilMatrix {
    pub fn new(grid: &LatticeGrid) -> Self {
        let n = grid.len();
        Self {
            dims: grid.dims,
            spacing_um: grid.spacing_um,
            diag: vec![0.0; n],
            off: std::array::from_fn(|_| vec![0.0; n]),
            rhs: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diag.is_empty()
    }

    /// Reset all coefficients and the right hand side to zero.
    pub fn zero_out(&mut self) {
        self.diag.fill(0.0);
        for off in self.off.iter_mut() {
            off.fill(0.0);
        }
        self.rhs.fill(0.0);
    }

    /// Accumulate a diagonal coefficient and a right-hand-side contribution
    /// at one lattice point.
    #[inline]
    pub fn add_locally(&mut self, site: usize, diag_add: f64, rhs_add: f64) {
        self.diag[site] += diag_add;
        self.rhs[site] += rhs_add;
    }

    /// Add the uniform diffusion stencil `-kdiff * laplacian` over the
    /// whole lattice, one parallel sweep per coefficient array. Faces on
    /// the domain boundary get no coefficient, which is the no-flux
    /// (Neumann) discretization.
    pub fn add_diffusion(&mut self, kdiff: f64) {
        let w = kdiff / (self.spacing_um * self.spacing_um);
        let dims = self.dims;
        for (face, off) in self.off.iter_mut().enumerate() {
            off.par_iter_mut().enumerate().for_each(|(site, v)| {
                if face_neighbor(&dims, site, face).is_some() {
                    *v -= w;
                }
            });
        }
        self.diag.par_iter_mut().enumerate().for_each(|(site, d)| {
            let inside = (0..FACE_COUNT)
                .filter(|&face| face_neighbor(&dims, site, face).is_some())
                .count();
            *d += w * inside as f64;
        });
    }

    /// Overwrite a row with the identity and pin its value: used for
    /// Dirichlet boundary points.
    pub fn set_dirichlet_row(&mut self, site: usize, value: f64) {
        self.diag[site] = 1.0;
        for off in self.off.iter_mut() {
            off[site] = 0.0;
        }
        self.rhs[site] = value;
    }

    /// Apply Dirichlet rows on the lattice faces selected by the bitmask
    /// (bit 0: -x, 1: +x, 2: -y, 3: +y, 4: -z, 5: +z).
    pub fn apply_dirichlet_faces(&mut self, flags: u8, value: f64) {
        let [nx, ny, nz] = self.dims;
        for site in 0..self.len() {
            let ix = site % nx;
            let iy = (site / nx) % ny;
            let iz = site / (nx * ny);
            let on_face = (flags & 0b000001 != 0 && ix == 0)
                || (flags & 0b000010 != 0 && ix == nx - 1)
                || (flags & 0b000100 != 0 && iy == 0)
                || (flags & 0b001000 != 0 && iy == ny - 1)
                || (flags & 0b010000 != 0 && iz == 0)
                || (flags & 0b100000 != 0 && iz == nz - 1);
            if on_face {
                self.set_dirichlet_row(site, value);
            }
        }
    }

    /// y = A x
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        let dims = self.dims;
        y.par_iter_mut().enumerate().for_each(|(site, yi)| {
            let mut acc = self.diag[site] * x[site];
            for face in 0..FACE_COUNT {
                let c = self.off[face][site];
                if c != 0.0 {
                    if let Some(nb) = face_neighbor(&dims, site, face) {
                        acc += c * x[nb];
                    }
                }
            }
            *yi = acc;
        });
    }

    /// Sum of all coefficients in a row (diagnostic; zero in the interior
    /// of a pure diffusion operator).
    pub fn row_sum(&self, site: usize) -> f64 {
        let mut sum = self.diag[site];
        for face in 0..FACE_COUNT {
            if face_neighbor(&self.dims, site, face).is_some() {
                sum += self.off[face][site];
            }
        }
        sum
    }
}

/// Failure modes of the iterative solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearSolveError {
    /// Residual did not meet tolerance within the iteration cap; the outer
    /// controller may retry once with a rebuilt preconditioner
    MaxIterations { iterations: usize, residual: f64 },
    /// Krylov breakdown (vanishing inner product)
    Breakdown,
}

impl std::fmt::Display for LinearSolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinearSolveError::MaxIterations {
                iterations,
                residual,
            } => write!(
                f,
                "linear solve hit the iteration cap ({} iterations, residual {:.3e})",
                iterations, residual
            ),
            LinearSolveError::Breakdown => write!(f, "linear solve breakdown (rho ~ 0)"),
        }
    }
}

impl std::error::Error for LinearSolveError {}

/// Jacobi-preconditioned BiCGStab.
#[derive(Debug, Clone)]
pub struct BiCgStabSolver {
    /// Cached inverse diagonal; reused across solves when requested
    inv_diag: Vec<f64>,
    /// Iterations used by the most recent solve
    pub iteration_count: usize,
    pub max_iterations: usize,
    /// Convergence threshold on ||r|| relative to ||rhs||
    pub tolerance: f64,
}

impl Default for BiCgStabSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BiCgStabSolver {
    pub fn new() -> Self {
        Self {
            inv_diag: Vec::new(),
            iteration_count: 0,
            max_iterations: 500,
            tolerance: 1.0e-8,
        }
    }

    fn build_preconditioner(&mut self, m: &StencilMatrix) {
        self.inv_diag.clear();
        self.inv_diag
            .extend(m.diag.iter().map(|&d| if d != 0.0 { 1.0 / d } else { 1.0 }));
    }

    /// Solve A x = rhs, starting from the initial guess in `x`.
    pub fn solve(
        &mut self,
        m: &StencilMatrix,
        x: &mut [f64],
    ) -> Result<(), LinearSolveError> {
        self.solve_with(m, x, false)
    }

    /// Like [`Self::solve`]; `keep_preconditioner` reuses the inverse
    /// diagonal cached by the previous solve instead of rebuilding it from
    /// the current matrix.
    pub fn solve_with(
        &mut self,
        m: &StencilMatrix,
        x: &mut [f64],
        keep_preconditioner: bool,
    ) -> Result<(), LinearSolveError> {
        let n = m.len();
        assert_eq!(x.len(), n);
        self.iteration_count = 0;

        if !keep_preconditioner || self.inv_diag.len() != n {
            self.build_preconditioner(m);
        }

        let bnorm = norm2(&m.rhs);
        if bnorm == 0.0 {
            x.fill(0.0);
            return Ok(());
        }
        let target = self.tolerance * bnorm;

        let mut r = vec![0.0; n];
        m.matvec(x, &mut r);
        for i in 0..n {
            r[i] = m.rhs[i] - r[i];
        }
        if norm2(&r) <= target {
            return Ok(());
        }

        let r_hat = r.clone();
        let mut rho = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;
        let mut p = vec![0.0; n];
        let mut v = vec![0.0; n];
        let mut p_hat = vec![0.0; n];
        let mut s = vec![0.0; n];
        let mut s_hat = vec![0.0; n];
        let mut t = vec![0.0; n];

        for iter in 1..=self.max_iterations {
            self.iteration_count = iter;

            let rho_next = dot(&r_hat, &r);
            if rho_next.abs() < f64::MIN_POSITIVE * 1.0e4 {
                return Err(LinearSolveError::Breakdown);
            }
            let beta = (rho_next / rho) * (alpha / omega);
            for i in 0..n {
                p[i] = r[i] + beta * (p[i] - omega * v[i]);
            }
            for i in 0..n {
                p_hat[i] = self.inv_diag[i] * p[i];
            }
            m.matvec(&p_hat, &mut v);
            let rv = dot(&r_hat, &v);
            if rv.abs() < f64::MIN_POSITIVE * 1.0e4 {
                return Err(LinearSolveError::Breakdown);
            }
            alpha = rho_next / rv;
            for i in 0..n {
                s[i] = r[i] - alpha * v[i];
            }
            if norm2(&s) <= target {
                for i in 0..n {
                    x[i] += alpha * p_hat[i];
                }
                return Ok(());
            }
            for i in 0..n {
                s_hat[i] = self.inv_diag[i] * s[i];
            }
            m.matvec(&s_hat, &mut t);
            let tt = dot(&t, &t);
            if tt == 0.0 {
                return Err(LinearSolveError::Breakdown);
            }
            omega = dot(&t, &s) / tt;
            for i in 0..n {
                x[i] += alpha * p_hat[i] + omega * s_hat[i];
                r[i] = s[i] - omega * t[i];
            }
            if norm2(&r) <= target {
                return Ok(());
            }
            rho = rho_next;
        }

        Err(LinearSolveError::MaxIterations {
            iterations: self.max_iterations,
            residual: norm2(&r) / bnorm,
        })
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

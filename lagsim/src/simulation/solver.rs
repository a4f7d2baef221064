//! Conditioned linear solve for the Lagrange multipliers.
//!
//! Solves `A λ = b` where `A = J W Jᵀ` is symmetric positive semi-definite.
//! Two strategies are available:
//!
//! - **Cholesky** (default): symmetric Jacobi conditioning `P = diag(A)^-1/2`,
//!   then a Cholesky factorisation of `P A P`, whose diagonal is all ones.
//!   The smallest pivot of the factor is the conditioning check.
//! - **Conjugate gradient**: Jacobi-preconditioned CG, warm-started from the
//!   previous multipliers. Falls back to the Cholesky path when it does not
//!   converge.
//!
//! Redundant constraints make `A` singular. When that is detected the solve
//! is retried on `P A P + εI`; a null-space component of λ produces no force
//! (`Jᵀ` annihilates it), so the regularised answer is still usable. If even
//! that fails the multipliers are zeroed and the evaluation applies no
//! constraint force.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::Deserialize;

/// Strategy used for `A λ = b`
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverKind {
    #[default]
    #[serde(rename = "cholesky")]
    Cholesky,
    #[serde(rename = "cg")]
    ConjugateGradient,
}

/// Numerical settings of the multiplier solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSettings {
    pub kind: SolverKind,
    pub conditioning_tolerance: f64, // smallest acceptable pivot of the conditioned factor
    pub regularization: f64, // ε added to the conditioned diagonal on fallback
    pub cg_max_iterations: usize,
    pub cg_tolerance: f64, // relative residual
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            kind: SolverKind::Cholesky,
            conditioning_tolerance: 1.0e-10,
            regularization: 1.0e-9,
            cg_max_iterations: 200,
            cg_tolerance: 1.0e-10,
        }
    }
}

/// Why a solve needed special handling
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Degeneracy {
    /// Factorisation succeeded but a pivot fell below the tolerance
    IllConditioned { min_pivot: f64 },
    /// The conditioned matrix is not positive definite
    Singular,
    /// CG ran out of iterations before reaching the tolerance
    NotConverged { iterations: usize, residual: f64 },
}

/// Outcome of one solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub degeneracy: Option<Degeneracy>,
    pub applied: bool, // false when λ was zeroed
    pub iterations: usize, // CG iterations, 0 for Cholesky
}

impl SolveReport {
    fn clean(iterations: usize) -> Self {
        Self {
            degeneracy: None,
            applied: true,
            iterations,
        }
    }
}

/// Multiplier solver with preallocated workspace
#[derive(Debug, Clone)]
pub struct LinearSolver {
    settings: SolverSettings,
    conditioning: DVector<f64>, // P, stored as its diagonal
    conditioned: DMatrix<f64>, // P A P
    rhs: DVector<f64>, // P b
}

impl LinearSolver {
    /// Workspace for systems of `size` multipliers
    pub fn new(settings: SolverSettings, size: usize) -> Self {
        Self {
            settings,
            conditioning: DVector::from_element(size, 1.0),
            conditioned: DMatrix::zeros(size, size),
            rhs: DVector::zeros(size),
        }
    }

    /// Solve `a * x = b`. `x` holds the previous solution on entry (CG warm start).
    pub fn solve(&mut self, a: &DMatrix<f64>, b: &DVector<f64>, x: &mut DVector<f64>) -> SolveReport {
        let n = b.len();
        if n == 0 {
            return SolveReport::clean(0);
        }
        if x.len() != n || x.iter().any(|v| !v.is_finite()) {
            *x = DVector::zeros(n);
        }

        match self.settings.kind {
            SolverKind::Cholesky => self.solve_direct(a, b, x),
            SolverKind::ConjugateGradient => {
                let (iterations, residual, converged) = self.solve_cg(a, b, x);
                if converged {
                    return SolveReport::clean(iterations);
                }
                let mut report = self.solve_direct(a, b, x);
                report.iterations = iterations;
                report.degeneracy = report
                    .degeneracy
                    .or(Some(Degeneracy::NotConverged { iterations, residual }));
                report
            }
        }
    }

    fn condition(&mut self, a: &DMatrix<f64>, b: &DVector<f64>) {
        let n = b.len();
        for i in 0..n {
            let d = a[(i, i)];
            self.conditioning[i] = if d > f64::MIN_POSITIVE { d.sqrt().recip() } else { 1.0 };
        }
        for c in 0..n {
            for r in 0..n {
                self.conditioned[(r, c)] = self.conditioning[r] * a[(r, c)] * self.conditioning[c];
            }
        }
        self.rhs.copy_from(&b.component_mul(&self.conditioning));
    }

    fn solve_direct(&mut self, a: &DMatrix<f64>, b: &DVector<f64>, x: &mut DVector<f64>) -> SolveReport {
        self.condition(a, b);

        let degeneracy = match Cholesky::new(self.conditioned.clone()) {
            Some(chol) => {
                let min_pivot = min_pivot(&chol);
                if min_pivot >= self.settings.conditioning_tolerance {
                    let y = chol.solve(&self.rhs);
                    x.copy_from(&y.component_mul(&self.conditioning));
                    return SolveReport::clean(0);
                }
                Degeneracy::IllConditioned { min_pivot }
            }
            None => Degeneracy::Singular,
        };

        let mut regularized = self.conditioned.clone();
        for i in 0..regularized.nrows() {
            regularized[(i, i)] += self.settings.regularization;
        }
        match Cholesky::new(regularized) {
            Some(chol) => {
                let y = chol.solve(&self.rhs);
                x.copy_from(&y.component_mul(&self.conditioning));
                SolveReport {
                    degeneracy: Some(degeneracy),
                    applied: true,
                    iterations: 0,
                }
            }
            None => {
                x.fill(0.0);
                SolveReport {
                    degeneracy: Some(Degeneracy::Singular),
                    applied: false,
                    iterations: 0,
                }
            }
        }
    }

    /// Jacobi-preconditioned conjugate gradient. Returns (iterations, relative residual, converged).
    fn solve_cg(&mut self, a: &DMatrix<f64>, b: &DVector<f64>, x: &mut DVector<f64>) -> (usize, f64, bool) {
        let n = b.len();
        let inv_diag = DVector::from_fn(n, |i, _| {
            let d = a[(i, i)];
            if d.abs() > 1e-15 { 1.0 / d } else { 1.0 }
        });

        let b_norm = b.norm().max(1e-15);
        let mut r = b - a * &*x;
        let mut residual = r.norm() / b_norm;
        if residual < self.settings.cg_tolerance {
            return (0, residual, true);
        }

        let mut z = r.component_mul(&inv_diag);
        let mut p = z.clone();
        let mut r_dot_z = r.dot(&z);

        for k in 0..self.settings.cg_max_iterations {
            let ap = a * &p;
            let p_dot_ap = p.dot(&ap);
            if p_dot_ap.abs() < 1e-30 {
                // breakdown
                return (k + 1, residual, false);
            }
            let alpha = r_dot_z / p_dot_ap;
            x.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);

            residual = r.norm() / b_norm;
            if !residual.is_finite() {
                return (k + 1, residual, false);
            }
            if residual < self.settings.cg_tolerance {
                return (k + 1, residual, true);
            }

            z = r.component_mul(&inv_diag);
            let r_dot_z_new = r.dot(&z);
            let beta = r_dot_z_new / r_dot_z.max(1e-30);
            r_dot_z = r_dot_z_new;
            p = &z + beta * &p;
        }

        (self.settings.cg_max_iterations, residual, false)
    }
}

/// Smallest squared diagonal entry of the Cholesky factor
fn min_pivot(chol: &Cholesky<f64, Dyn>) -> f64 {
    chol.l_dirty()
        .diagonal()
        .iter()
        .map(|v| v * v)
        .fold(f64::INFINITY, f64::min)
}

//! Restarted Krylov solvers over matrix-free operators.
//!
//! The kernel is flexible GMRES with right preconditioning (Saad §9.4): the
//! preconditioned basis `Z` is stored next to the Arnoldi basis `V`, and the
//! update is `x += Z y`. With the identity preconditioner this is plain
//! restarted GMRES.
//!
//! Every inner product goes through [`LinearOperator::dot`], so an operator
//! over a distributed vector turns each one into a collective. All ranks then
//! hold identical Hessenberg entries and take identical branches.

use nalgebra::DMatrix;
use tracing::{debug, trace};

use crate::error::{LinearSolverError, Result};
use crate::options::SolverOptions;

/// A linear operator `y = A x` evaluated without forming `A`.
pub trait LinearOperator {
    /// Length of the rank-local pieces of `x` and `y`.
    fn local_dim(&self) -> usize;

    /// Computes `y = A x`. `x` is read only.
    fn apply(&mut self, x: &[f64], y: &mut [f64]) -> Result<()>;

    /// Inner product of two vectors in the operator's (possibly distributed)
    /// space.
    fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64> {
        Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
    }

    fn norm(&self, a: &[f64]) -> Result<f64> {
        Ok(self.dot(a, a)?.sqrt())
    }
}

/// Right preconditioner `z = M⁻¹ r`.
pub trait Preconditioner {
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<()>;
}

/// Pass-through preconditioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPreconditioner;

impl Preconditioner for IdentityPreconditioner {
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<()> {
        z.copy_from_slice(r);
        Ok(())
    }
}

/// Dense matrix as an operator. Used for small local blocks.
pub struct DenseOperator<'m> {
    matrix: &'m DMatrix<f64>,
}

impl<'m> DenseOperator<'m> {
    pub fn new(matrix: &'m DMatrix<f64>) -> Self {
        Self { matrix }
    }
}

impl LinearOperator for DenseOperator<'_> {
    fn local_dim(&self) -> usize {
        self.matrix.nrows()
    }

    fn apply(&mut self, x: &[f64], y: &mut [f64]) -> Result<()> {
        for (i, yi) in y.iter_mut().enumerate() {
            *yi = self.matrix.row(i).iter().zip(x).map(|(a, b)| a * b).sum();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrylovSettings {
    pub restart: usize,
    pub max_iterations: usize,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
}

impl KrylovSettings {
    /// Stops on `‖r‖ ≤ max(atol, rtol·‖b‖)`.
    pub fn from_options(options: &SolverOptions) -> Self {
        Self {
            restart: options.restart,
            max_iterations: options.max_iterations,
            absolute_tolerance: options.absolute_tolerance,
            relative_tolerance: options.relative_tolerance,
        }
    }

    /// Stops on `‖r‖ ≤ atol` only.
    pub fn absolute(options: &SolverOptions) -> Self {
        Self {
            relative_tolerance: 0.0,
            ..Self::from_options(options)
        }
    }

    pub fn with_restart(mut self, restart: usize) -> Self {
        self.restart = restart;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrylovStatus {
    Converged,
    /// Iteration limit reached before the tolerance.
    MaxIterations,
    /// The Hessenberg system became singular or the residual non-finite.
    Breakdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrylovOutcome {
    pub status: KrylovStatus,
    pub iterations: usize,
    pub residual_norm: f64,
}

impl KrylovOutcome {
    pub fn converged(&self) -> bool {
        self.status == KrylovStatus::Converged
    }
}

/// Restarted GMRES without preconditioning.
pub fn gmres<A: LinearOperator + ?Sized>(
    op: &mut A,
    b: &[f64],
    x: &mut [f64],
    settings: &KrylovSettings,
) -> Result<KrylovOutcome> {
    fgmres(op, &mut IdentityPreconditioner, b, x, settings)
}

/// Restarted flexible GMRES with right preconditioning.
///
/// `x` holds the initial guess on entry and the best available iterate on
/// return, whatever the status. `max_iterations` bounds the total number of
/// operator applications inside Arnoldi cycles.
pub fn fgmres<A, P>(
    op: &mut A,
    pc: &mut P,
    b: &[f64],
    x: &mut [f64],
    settings: &KrylovSettings,
) -> Result<KrylovOutcome>
where
    A: LinearOperator + ?Sized,
    P: Preconditioner + ?Sized,
{
    let n = op.local_dim();
    if b.len() != n || x.len() != n {
        return Err(LinearSolverError::DimensionMismatch {
            message: format!(
                "GMRES operator has local dimension {}, rhs {}, iterate {}",
                n,
                b.len(),
                x.len()
            ),
        });
    }
    if settings.restart == 0 {
        return Err(LinearSolverError::InvalidOptions {
            message: "restart must be greater than zero".to_string(),
        });
    }

    let b_norm = op.norm(b)?;
    let target = settings
        .absolute_tolerance
        .max(settings.relative_tolerance * b_norm);

    let mut r = vec![0.0; n];
    let mut ax = vec![0.0; n];
    let mut r_norm = residual(op, b, x, &mut ax, &mut r)?;
    let mut iterations = 0usize;

    debug!(
        n,
        b_norm,
        target,
        restart = settings.restart,
        max_iterations = settings.max_iterations,
        "GMRES start"
    );

    loop {
        if !r_norm.is_finite() {
            return Ok(outcome(KrylovStatus::Breakdown, iterations, r_norm));
        }
        if r_norm <= target {
            return Ok(outcome(KrylovStatus::Converged, iterations, r_norm));
        }
        if iterations >= settings.max_iterations {
            return Ok(outcome(KrylovStatus::MaxIterations, iterations, r_norm));
        }

        // Cycle storage grows by one column per iteration.
        let m = settings.restart.min(settings.max_iterations - iterations);
        let mut v: Vec<Vec<f64>> = Vec::new();
        let mut z: Vec<Vec<f64>> = Vec::new();
        // Column k of the Hessenberg matrix, rows 0..=k+1.
        let mut h: Vec<Vec<f64>> = Vec::new();
        let mut cs: Vec<f64> = Vec::new();
        let mut sn: Vec<f64> = Vec::new();
        let mut g = vec![r_norm];

        v.push(r.iter().map(|ri| ri / r_norm).collect());

        let mut k_done = 0usize;
        let mut broke_down = false;
        let mut invariant = false;

        for k in 0..m {
            iterations += 1;

            let mut zk = vec![0.0; n];
            pc.apply(&v[k], &mut zk)?;
            let mut w = vec![0.0; n];
            op.apply(&zk, &mut w)?;
            z.push(zk);

            let col_norm = op.norm(&w)?;

            // Modified Gram-Schmidt
            let mut hk = vec![0.0; k + 2];
            for j in 0..=k {
                hk[j] = op.dot(&w, &v[j])?;
                axpy(&mut w, -hk[j], &v[j]);
            }
            let sub = op.norm(&w)?;
            hk[k + 1] = sub;

            for j in 0..k {
                let temp = cs[j] * hk[j] + sn[j] * hk[j + 1];
                hk[j + 1] = -sn[j] * hk[j] + cs[j] * hk[j + 1];
                hk[j] = temp;
            }

            let (c, s) = givens(hk[k], hk[k + 1]);
            let pivot = c * hk[k] + s * hk[k + 1];
            if !pivot.is_finite() || pivot.abs() <= f64::EPSILON * col_norm || col_norm == 0.0 {
                // A z_k adds nothing outside the current basis: the projected
                // system is singular and column k is dropped.
                broke_down = true;
                break;
            }
            cs.push(c);
            sn.push(s);
            hk[k] = pivot;
            hk[k + 1] = 0.0;
            h.push(hk);

            g.push(-s * g[k]);
            g[k] *= c;
            k_done = k + 1;

            trace!(iteration = iterations, residual = g[k + 1].abs(), "GMRES iteration");

            // Lucky breakdown: the Krylov space is invariant up to rounding.
            invariant = sub <= f64::EPSILON * col_norm;
            if invariant || g[k + 1].abs() <= target || iterations >= settings.max_iterations {
                break;
            }
            v.push(w.iter().map(|wi| wi / sub).collect());
        }

        let mut y = vec![0.0; k_done];
        for i in (0..k_done).rev() {
            let mut sum = g[i];
            for j in (i + 1)..k_done {
                sum -= h[j][i] * y[j];
            }
            y[i] = sum / h[i][i];
        }
        for (j, yj) in y.iter().enumerate() {
            axpy(x, *yj, &z[j]);
        }

        r_norm = residual(op, b, x, &mut ax, &mut r)?;

        if invariant && r_norm.is_finite() {
            return Ok(outcome(KrylovStatus::Converged, iterations, r_norm));
        }
        if broke_down {
            let status = if r_norm <= target {
                KrylovStatus::Converged
            } else {
                KrylovStatus::Breakdown
            };
            return Ok(outcome(status, iterations, r_norm));
        }
    }
}

fn outcome(status: KrylovStatus, iterations: usize, residual_norm: f64) -> KrylovOutcome {
    debug!(?status, iterations, residual_norm, "GMRES finished");
    KrylovOutcome {
        status,
        iterations,
        residual_norm,
    }
}

fn residual<A: LinearOperator + ?Sized>(
    op: &mut A,
    b: &[f64],
    x: &[f64],
    ax: &mut [f64],
    r: &mut [f64],
) -> Result<f64> {
    op.apply(x, ax)?;
    for i in 0..r.len() {
        r[i] = b[i] - ax[i];
    }
    op.norm(r)
}

fn axpy(y: &mut [f64], a: f64, x: &[f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}

fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if a.abs() > b.abs() {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, c * t)
    } else {
        let t = a / b;
        let s = 1.0 / (1.0 + t * t).sqrt();
        (s * t, s)
    }
}

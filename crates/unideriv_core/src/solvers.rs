//! Linear solver strategies for coupled-system derivatives.
//!
//! Every strategy borrows the system it inverts and answers two requests:
//! a gradient of outputs with respect to inputs, and a single solve of the
//! system's linearization against a caller-supplied right-hand side.

mod distributed;
mod gauss_seidel;
mod gmres;

pub use distributed::DistributedKrylov;
pub use gauss_seidel::LinearGaussSeidel;
pub use gmres::GmresSolver;

use nalgebra::DVector;

use crate::direction::{whole_variables, Direction};
use crate::error::{LinearSolverError, Result};
use crate::jacobian::{GradientAssembler, JacobianResult, ResolvedVar, ReturnFormat};
use crate::krylov::KrylovOutcome;
use crate::options::{DerivativeMode, LinearSolverKind};
use crate::traits::CoupledSystem;

/// A strategy for solving a coupled system's linearization.
pub trait LinearSolver {
    /// Jacobian of `outputs` with respect to `inputs`.
    ///
    /// Rows follow the outputs and columns the inputs in either mode. Slice
    /// directions, unknown variables and unsupported formats are rejected
    /// before the first solve.
    fn calc_gradient(
        &mut self,
        inputs: &[Direction],
        outputs: &[Direction],
        format: ReturnFormat,
    ) -> Result<JacobianResult>;

    /// Solves the system's linearization (transposed in adjoint mode) for
    /// the rank-local piece `rhs`.
    fn solve(&mut self, rhs: &DVector<f64>) -> Result<LinearSolution>;
}

/// Outcome of one linear solve.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolution {
    /// Best available solution, converged or not.
    pub x: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
}

impl LinearSolution {
    fn from_krylov(x: &[f64], outcome: &KrylovOutcome) -> Self {
        Self {
            x: DVector::from_column_slice(x),
            iterations: outcome.iterations,
            residual_norm: outcome.residual_norm,
            converged: outcome.converged(),
        }
    }
}

impl LinearSolverKind {
    /// Constructs the selected strategy over `system`.
    pub fn build<'a, S>(self, system: &'a mut S) -> Result<Box<dyn LinearSolver + 'a>>
    where
        S: CoupledSystem + ?Sized + 'a,
    {
        Ok(match self {
            LinearSolverKind::Gmres => Box::new(GmresSolver::new(system)),
            LinearSolverKind::DistributedKrylov => Box::new(DistributedKrylov::new(system)?),
            LinearSolverKind::GaussSeidel => Box::new(LinearGaussSeidel::new(system)),
        })
    }
}

fn check_rhs<S: CoupledSystem + ?Sized>(system: &S, rhs: &DVector<f64>) -> Result<()> {
    if rhs.len() != system.local_size() {
        return Err(LinearSolverError::DimensionMismatch {
            message: format!(
                "right-hand side has length {}, system '{}' has local size {}",
                rhs.len(),
                system.name(),
                system.local_size()
            ),
        });
    }
    Ok(())
}

/// Validates a direction set and resolves its local index ranges.
fn resolve_directions<'n, S: CoupledSystem + ?Sized>(
    system: &S,
    set: &'n [Direction],
) -> Result<Vec<ResolvedVar<'n>>> {
    whole_variables(set)?
        .into_iter()
        .map(|name| {
            let range = system
                .resolve_indices(name)
                .ok_or_else(|| LinearSolverError::UnknownVariable {
                    name: name.to_string(),
                })?;
            Ok(ResolvedVar { name, range })
        })
        .collect()
}

/// One solve per flat component of the driving variables, each scattered
/// into the result.
///
/// Forward mode drives over the inputs, adjoint mode over the outputs.
/// `solve_direction` receives a one-hot right-hand side of length `n`.
fn drive_directions<F>(
    mode: DerivativeMode,
    format: ReturnFormat,
    inputs: &[ResolvedVar<'_>],
    outputs: &[ResolvedVar<'_>],
    n: usize,
    mut solve_direction: F,
) -> Result<JacobianResult>
where
    F: FnMut(&DVector<f64>) -> Result<LinearSolution>,
{
    let mut assembler = GradientAssembler::new(mode, format, inputs, outputs);
    let (drive, others) = match mode {
        DerivativeMode::Forward => (inputs, outputs),
        DerivativeMode::Adjoint => (outputs, inputs),
    };

    let mut rhs = DVector::zeros(n);
    let mut j = 0;
    for param in drive {
        for (local, irhs) in param.range.iter().enumerate() {
            rhs[irhs] = 1.0;
            let solution = solve_direction(&rhs)?;
            rhs[irhs] = 0.0;
            assembler.scatter(param, local, j, others, &solution.x, solution.converged);
            j += 1;
        }
    }
    Ok(assembler.finish())
}

//! The matrix-free operator over a coupled system, and the residual monitor.

use crate::error::{LinearSolverError, Result};
use crate::krylov::LinearOperator;
use crate::traits::CoupledSystem;

/// `A·x` evaluated by the system's Jacobian-vector-product callback.
///
/// Holds nothing but the borrow of the system. Each application overwrites the
/// system's solution and residual-gradient vectors in place.
pub struct MatrixFreeOperator<'s, S: CoupledSystem + ?Sized> {
    system: &'s mut S,
}

impl<'s, S: CoupledSystem + ?Sized> MatrixFreeOperator<'s, S> {
    pub fn new(system: &'s mut S) -> Self {
        Self { system }
    }
}

impl<S: CoupledSystem + ?Sized> LinearOperator for MatrixFreeOperator<'_, S> {
    fn local_dim(&self) -> usize {
        self.system.local_size()
    }

    fn apply(&mut self, x: &[f64], y: &mut [f64]) -> Result<()> {
        apply_system(self.system, x)?;
        y.copy_from_slice(self.system.rhs_vector());
        Ok(())
    }

    fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64> {
        self.system.communicator().dot(a, b)
    }

    fn norm(&self, a: &[f64]) -> Result<f64> {
        self.system.communicator().norm(a)
    }
}

/// Loads `x`, clears the residual-gradient vector and cached partials, and
/// runs the product over the active variables. The result is left in the
/// system's residual-gradient vector.
fn apply_system<S: CoupledSystem + ?Sized>(system: &mut S, x: &[f64]) -> Result<()> {
    let n = system.local_size();
    if x.len() != n {
        return Err(LinearSolverError::DimensionMismatch {
            message: format!(
                "operator input has length {}, system '{}' has local size {}",
                x.len(),
                system.name(),
                n
            ),
        });
    }
    system.solution_vector_mut().copy_from_slice(x);
    system.rhs_vector_mut().fill(0.0);
    system.clear_partials();
    let vars = system.active_variables();
    system.apply_jacobian(&vars)?;
    Ok(())
}

/// Norm of the linear residual `b − A·x` at the system's current solution.
pub struct ConvergenceMonitor;

impl ConvergenceMonitor {
    /// Leaves `b − A·x` in the system's residual-gradient vector.
    ///
    /// Collective when the system is distributed: local sum of squares, then
    /// a global combine.
    pub fn residual_norm<S: CoupledSystem + ?Sized>(system: &mut S, b: &[f64]) -> Result<f64> {
        if b.len() != system.local_size() {
            return Err(LinearSolverError::DimensionMismatch {
                message: format!(
                    "right-hand side has length {}, system '{}' has local size {}",
                    b.len(),
                    system.name(),
                    system.local_size()
                ),
            });
        }
        system.rhs_vector_mut().fill(0.0);
        system.clear_partials();
        let vars = system.active_variables();
        system.apply_jacobian(&vars)?;
        for (r, bi) in system.rhs_vector_mut().iter_mut().zip(b) {
            *r = bi - *r;
        }
        system.communicator().norm(system.rhs_vector())
    }
}

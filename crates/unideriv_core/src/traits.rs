use std::collections::BTreeSet;

use crate::comm::{Communicator, SERIAL};
use crate::direction::IndexRange;
use crate::options::{DerivativeMode, SolverOptions};

/// Handle to one of a system's local partitions, in sweep order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub usize);

/// A coupled system whose linearization the solvers invert matrix-free.
///
/// The system owns the state vectors the solvers read and write in place:
/// the *solution* vector (`du` in forward mode, `df` in adjoint mode) and the
/// *residual-gradient* vector the Jacobian-vector product accumulates into.
/// In adjoint mode the system applies the transposed Jacobian; the solvers
/// never see the difference beyond the partition sweep order.
pub trait CoupledSystem {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Differentiation mode, read at the start of every solve.
    fn mode(&self) -> DerivativeMode;

    /// Default options for solves against this system.
    fn options(&self) -> SolverOptions;

    /// Length of this rank's piece of the state vectors.
    fn local_size(&self) -> usize;

    fn solution_vector(&self) -> &[f64];
    fn solution_vector_mut(&mut self) -> &mut [f64];
    fn rhs_vector(&self) -> &[f64];
    fn rhs_vector_mut(&mut self) -> &mut [f64];

    /// Drops cached parameter-side partial-derivative state.
    fn clear_partials(&mut self);

    /// Variables the whole-system product runs over, including those visible
    /// from an enclosing partition when this system is nested.
    fn active_variables(&self) -> BTreeSet<String>;

    /// Accumulates `J·sol` (forward) or `Jᵀ·sol` (adjoint), restricted to
    /// `vars`, into the residual-gradient vector.
    ///
    /// May be called repeatedly within one sweep. Distributed systems may
    /// issue collectives here.
    fn apply_jacobian(&mut self, vars: &BTreeSet<String>) -> anyhow::Result<()>;

    /// Local offsets of a variable. `None` if the system has no such variable;
    /// an empty range if the variable lives on another rank.
    fn resolve_indices(&self, name: &str) -> Option<IndexRange>;

    /// Local partitions in natural (forward) sweep order.
    fn local_partitions(&self) -> Vec<PartitionId>;

    /// Variables owned by a partition.
    fn partition_variables(&self, partition: PartitionId) -> BTreeSet<String>;

    /// Options override of a partition's local solve.
    fn partition_options(&self, _partition: PartitionId) -> Option<SolverOptions> {
        None
    }

    /// Forward: copies sibling state into the partition's parameter-side view.
    /// Adjoint: adds the partition's parameter-side contributions back onto
    /// the residual-gradient vector.
    fn scatter(&mut self, partition: PartitionId) -> anyhow::Result<()>;

    /// The partition's share of the Jacobian-vector product. Forward: rows of
    /// the partition against its parameter-side inputs among `vars`. Adjoint:
    /// the transposed product of the partition's rows onto the columns of
    /// `vars`, accumulated parameter-side until the next [`scatter`].
    ///
    /// [`scatter`]: CoupledSystem::scatter
    fn apply_partition_jacobian(
        &mut self,
        partition: PartitionId,
        vars: &BTreeSet<String>,
    ) -> anyhow::Result<()>;

    /// Solves the partition's diagonal block against the residual-gradient
    /// vector, writing the partition's entries of the solution vector.
    fn solve_partition(
        &mut self,
        partition: PartitionId,
        options: &SolverOptions,
    ) -> anyhow::Result<()>;

    /// Group the state vectors are distributed over.
    fn communicator(&self) -> &dyn Communicator {
        &SERIAL
    }

    /// Local state length of every rank, indexed by rank.
    fn local_sizes(&self) -> Vec<usize> {
        vec![self.local_size()]
    }

    /// Global flat size of a variable, wherever it lives.
    fn variable_size(&self, name: &str) -> Option<usize> {
        self.resolve_indices(name).map(|r| r.len())
    }

    /// Whether `of` depends linearly on `wrt` through some coupling path.
    fn depends_on(&self, _of: &str, _wrt: &str) -> bool {
        true
    }

    /// Current nonlinear residual, the right-hand side of a Newton step.
    fn residual_vector(&self) -> &[f64];

    /// Slot receiving the Newton state update.
    fn newton_update_mut(&mut self) -> &mut [f64];
}

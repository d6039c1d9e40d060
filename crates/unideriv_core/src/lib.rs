//! Matrix-free linear solvers for derivatives of coupled systems.
//!
//! A coupled system exposes its residual Jacobian only through products
//! (see [`CoupledSystem`]). The solvers here invert that linearization to
//! produce total derivatives of outputs with respect to inputs, one solve per
//! input component in forward mode or per output component in adjoint mode:
//!
//! - [`GmresSolver`]: serial restarted GMRES.
//! - [`DistributedKrylov`]: right-preconditioned flexible GMRES whose inner
//!   products are collectives over a [`Communicator`]; also takes Newton steps.
//! - [`LinearGaussSeidel`]: block Gauss-Seidel over the system's partitions.
//!
//! [`SparseCoupledModel`] is a ready-made system over a sparse Jacobian.

pub mod comm;
pub mod direction;
pub mod error;
pub mod jacobian;
pub mod krylov;
pub mod model;
pub mod operator;
pub mod options;
pub mod solvers;
pub mod traits;

pub use comm::{Communicator, SerialCommunicator, ThreadCommunicator};
pub use direction::{directions, Direction, IndexRange};
pub use error::{LinearSolverError, Result};
pub use jacobian::{JacobianResult, JacobianValues, NestedJacobian, ReturnFormat};
pub use model::{ModelBuilder, SparseCoupledModel};
pub use options::{DerivativeMode, LinearSolverKind, SolverOptions};
pub use solvers::{DistributedKrylov, GmresSolver, LinearGaussSeidel, LinearSolution, LinearSolver};
pub use traits::{CoupledSystem, PartitionId};

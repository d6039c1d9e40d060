//! Error types for the linear solvers.

use thiserror::Error;

/// Result type for linear solver operations
pub type Result<T> = std::result::Result<T, LinearSolverError>;

/// Errors raised by the linear solvers.
///
/// Non-convergence is deliberately absent: it is logged and reported through
/// the `converged` flags of the returned solutions instead.
#[derive(Error, Debug)]
pub enum LinearSolverError {
    /// A direction requested an index slice of a variable.
    #[error("Array slice inputs and outputs currently not supported: '{request}'")]
    UnsupportedSlice { request: String },

    /// A Jacobian return format the strategy cannot produce.
    #[error("unsupported solve return_format '{format}'")]
    UnsupportedFormat { format: String },

    /// A direction named a variable the system does not know.
    #[error("Unknown variable '{name}'")]
    UnknownVariable { name: String },

    /// Buffer or vector lengths disagree.
    #[error("Dimension mismatch: {message}")]
    DimensionMismatch { message: String },

    /// Options violate their invariants.
    #[error("Invalid options: {message}")]
    InvalidOptions { message: String },

    /// The operation needs a different differentiation mode.
    #[error("Operation '{operation}' requires {required} mode, system is in {actual} mode")]
    ModeMismatch {
        operation: &'static str,
        required: crate::options::DerivativeMode,
        actual: crate::options::DerivativeMode,
    },

    /// Ranks disagree on the shape or order of a collective operation.
    #[error("Collective mismatch on rank {rank}: {message}")]
    CollectiveMismatch { rank: usize, message: String },

    /// Block Gauss-Seidel was asked to sweep a system without partitions.
    #[error("System '{system}' has no local partitions to sweep")]
    NoPartitions { system: String },

    /// A coupled-system callback failed.
    #[error("System callback failed: {0}")]
    System(anyhow::Error),
}

impl From<anyhow::Error> for LinearSolverError {
    /// Solver errors raised inside a callback (a collective issued by the
    /// system, say) come back out unwrapped.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<LinearSolverError>() {
            Ok(inner) => inner,
            Err(err) => LinearSolverError::System(err),
        }
    }
}

impl LinearSolverError {
    /// True for errors raised while validating a request, before any solve ran.
    pub fn is_unsupported_request(&self) -> bool {
        matches!(
            self,
            LinearSolverError::UnsupportedSlice { .. }
                | LinearSolverError::UnsupportedFormat { .. }
                | LinearSolverError::UnknownVariable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DerivativeMode;

    #[test]
    fn slice_error_names_request() {
        let err = LinearSolverError::UnsupportedSlice {
            request: "x[0, 2]".to_string(),
        };
        let message = format!("{err}");
        assert!(message.contains("x[0, 2]"));
        assert!(message.contains("not supported"));
        assert!(err.is_unsupported_request());
    }

    #[test]
    fn mode_mismatch_formats_modes() {
        let err = LinearSolverError::ModeMismatch {
            operation: "newton",
            required: DerivativeMode::Forward,
            actual: DerivativeMode::Adjoint,
        };
        assert_eq!(
            format!("{err}"),
            "Operation 'newton' requires forward mode, system is in adjoint mode"
        );
        assert!(!err.is_unsupported_request());
    }

    #[test]
    fn callback_errors_convert() {
        let err: LinearSolverError = anyhow::anyhow!("component exploded").into();
        assert!(matches!(err, LinearSolverError::System(_)));
        assert!(format!("{err}").contains("component exploded"));
    }

    #[test]
    fn solver_errors_survive_a_callback() {
        let inner = LinearSolverError::CollectiveMismatch {
            rank: 1,
            message: "length".to_string(),
        };
        let err: LinearSolverError = anyhow::Error::new(inner).into();
        assert!(matches!(
            err,
            LinearSolverError::CollectiveMismatch { rank: 1, .. }
        ));
    }
}

//! Solver configuration.
//!
//! Options are supplied by the owning system and may be overridden per
//! partition. All types here are serde-friendly so a framework can load them
//! from its own configuration documents.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LinearSolverError, Result};

/// Differentiation mode of a coupled system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeMode {
    /// Propagate input perturbations to outputs (one solve per input component).
    Forward,
    /// Propagate output sensitivities back to inputs (one solve per output component).
    Adjoint,
}

impl fmt::Display for DerivativeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivativeMode::Forward => write!(f, "forward"),
            DerivativeMode::Adjoint => write!(f, "adjoint"),
        }
    }
}

/// Iteration limits and tolerances for one linear solve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    /// Krylov subspace dimension before a restart.
    pub restart: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            absolute_tolerance: 1e-9,
            relative_tolerance: 1e-9,
            restart: 20,
        }
    }
}

impl SolverOptions {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_absolute_tolerance(mut self, tol: f64) -> Self {
        self.absolute_tolerance = tol;
        self
    }

    pub fn with_relative_tolerance(mut self, tol: f64) -> Self {
        self.relative_tolerance = tol;
        self
    }

    pub fn with_restart(mut self, restart: usize) -> Self {
        self.restart = restart;
        self
    }

    /// Checks the option invariants. Called before any numerical work.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be greater than zero"));
        }
        if self.restart == 0 {
            return Err(invalid("restart must be greater than zero"));
        }
        if !(self.absolute_tolerance >= 0.0) {
            return Err(invalid(format!(
                "absolute_tolerance must be non-negative, got {}",
                self.absolute_tolerance
            )));
        }
        if !(self.relative_tolerance >= 0.0) {
            return Err(invalid(format!(
                "relative_tolerance must be non-negative, got {}",
                self.relative_tolerance
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> LinearSolverError {
    LinearSolverError::InvalidOptions {
        message: message.into(),
    }
}

/// Strategy a system selects for its derivative solves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type")]
pub enum LinearSolverKind {
    /// Serial restarted GMRES.
    #[default]
    Gmres,
    /// Flexible GMRES across the ranks of the system's communicator.
    DistributedKrylov,
    /// Block Gauss-Seidel over the system's local partitions.
    GaussSeidel,
}

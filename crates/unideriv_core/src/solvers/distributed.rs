//! Preconditioned flexible GMRES across the ranks of a distributed system.
//!
//! The operator is the square global linearization restricted to this rank's
//! rows. Every inner product is an all-reduce over the system's communicator,
//! so all ranks run the same Krylov iteration in lockstep and must call into
//! this solver with the same requests in the same order.

use nalgebra::DVector;
use std::collections::BTreeMap;
use tracing::{debug, error};

use super::{check_rhs, LinearSolution, LinearSolver};
use crate::direction::{whole_variables, Direction, IndexRange};
use crate::error::{LinearSolverError, Result};
use crate::jacobian::{GradientAssembler, JacobianResult, ResolvedVar, ReturnFormat};
use crate::krylov::{fgmres, IdentityPreconditioner, KrylovOutcome, KrylovSettings, KrylovStatus};
use crate::operator::MatrixFreeOperator;
use crate::options::{DerivativeMode, SolverOptions};
use crate::traits::CoupledSystem;

pub const DEFAULT_RESTART: usize = 1000;

pub struct DistributedKrylov<'a, S: CoupledSystem + ?Sized> {
    system: &'a mut S,
    options: Option<SolverOptions>,
    newton_options: Option<SolverOptions>,
    restart: usize,
    preconditioner: IdentityPreconditioner,
    rhs: Vec<f64>,
    x: Vec<f64>,
}

impl<'a, S: CoupledSystem + ?Sized> DistributedKrylov<'a, S> {
    /// Fails if the system's local size disagrees with its size table.
    pub fn new(system: &'a mut S) -> Result<Self> {
        let rank = system.communicator().rank();
        let sizes = system.local_sizes();
        let n = system.local_size();
        if sizes.len() != system.communicator().size() || sizes.get(rank) != Some(&n) {
            return Err(LinearSolverError::CollectiveMismatch {
                rank,
                message: format!(
                    "system '{}' has local size {} but the size table is {:?}",
                    system.name(),
                    n,
                    sizes
                ),
            });
        }
        Ok(Self {
            system,
            options: None,
            newton_options: None,
            restart: DEFAULT_RESTART,
            preconditioner: IdentityPreconditioner,
            rhs: vec![0.0; n],
            x: vec![0.0; n],
        })
    }

    /// Overrides the gradient-solve options the system supplies.
    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Options for [`newton`](Self::newton) only.
    pub fn with_newton_options(mut self, options: SolverOptions) -> Self {
        self.newton_options = Some(options);
        self
    }

    pub fn with_restart(mut self, restart: usize) -> Self {
        self.restart = restart;
        self
    }

    pub fn options(&self) -> SolverOptions {
        self.options.unwrap_or_else(|| self.system.options())
    }

    pub fn newton_options(&self) -> SolverOptions {
        self.newton_options.unwrap_or_else(|| self.system.options())
    }

    fn settings(&self, options: &SolverOptions) -> Result<KrylovSettings> {
        options.validate()?;
        Ok(KrylovSettings::from_options(options).with_restart(self.restart))
    }

    /// Runs FGMRES on `self.rhs` from the initial guess in `self.x`.
    fn run(&mut self, settings: &KrylovSettings) -> Result<KrylovOutcome> {
        let mut op = MatrixFreeOperator::new(&mut *self.system);
        fgmres(
            &mut op,
            &mut self.preconditioner,
            &self.rhs,
            &mut self.x,
            settings,
        )
    }

    fn report(&self, what: &str, outcome: &KrylovOutcome) {
        let rank = self.system.communicator().rank();
        match outcome.status {
            KrylovStatus::Converged => debug!(
                system = self.system.name(),
                rank,
                iterations = outcome.iterations,
                residual = outcome.residual_norm,
                "{} converged",
                what
            ),
            KrylovStatus::MaxIterations => error!(
                system = self.system.name(),
                rank,
                iterations = outcome.iterations,
                residual = outcome.residual_norm,
                "{} in '{}' failed to converge after {} iterations",
                what,
                self.system.name(),
                outcome.iterations
            ),
            KrylovStatus::Breakdown => error!(
                system = self.system.name(),
                rank,
                residual = outcome.residual_norm,
                "{} in '{}' failed",
                what,
                self.system.name()
            ),
        }
    }

    /// Solves for flat component `index` of `param` and gathers every
    /// variable in `others` linked to it, in global layout. The rank owning
    /// `param` seeds the right-hand side; the others contribute zeros.
    ///
    /// Collective: every rank must call this with the same arguments. The
    /// returned map and convergence flag are identical on all ranks.
    pub fn compute_directional_derivative(
        &mut self,
        param: &str,
        index: usize,
        others: &[&str],
    ) -> Result<(BTreeMap<String, DVector<f64>>, bool)> {
        let range = self
            .system
            .resolve_indices(param)
            .ok_or_else(|| LinearSolverError::UnknownVariable {
                name: param.to_string(),
            })?;
        let settings = self.settings(&self.options())?;

        let n = self.system.local_size();
        self.rhs.clear();
        self.rhs.resize(n, 0.0);
        self.x.clear();
        self.x.resize(n, 0.0);
        if let Some(&i) = range.offsets().get(index) {
            self.rhs[i] = 1.0;
        }

        let outcome = self.run(&settings)?;
        self.report("directional derivative", &outcome);

        let mode = self.system.mode();
        let mut solvec = BTreeMap::new();
        for &other in others {
            let linked = match mode {
                DerivativeMode::Forward => self.system.depends_on(other, param),
                DerivativeMode::Adjoint => self.system.depends_on(param, other),
            };
            if !linked {
                continue;
            }
            solvec.insert(other.to_string(), self.gather(other)?);
        }
        Ok((solvec, outcome.converged()))
    }

    /// Full value of `name` from the current iterate, summed over ranks.
    fn gather(&self, name: &str) -> Result<DVector<f64>> {
        let size = self.global_size(name)?;
        let mut values = vec![0.0; size];
        if let Some(range) = self.system.resolve_indices(name) {
            for (v, i) in values.iter_mut().zip(range.iter()) {
                *v = self.x[i];
            }
        }
        self.system.communicator().all_reduce_sum(&mut values)?;
        Ok(DVector::from_vec(values))
    }

    fn global_size(&self, name: &str) -> Result<usize> {
        self.system
            .variable_size(name)
            .ok_or_else(|| LinearSolverError::UnknownVariable {
                name: name.to_string(),
            })
    }

    /// One Newton step: solves `J·δ = f` for the current nonlinear residual
    /// `f`, starting from the current solution vector, and stores `−δ` as the
    /// system's Newton update.
    pub fn newton(&mut self) -> Result<LinearSolution> {
        let mode = self.system.mode();
        if mode != DerivativeMode::Forward {
            return Err(LinearSolverError::ModeMismatch {
                operation: "newton",
                required: DerivativeMode::Forward,
                actual: mode,
            });
        }
        let settings = self.settings(&self.newton_options())?;

        self.rhs.clear();
        self.rhs.extend_from_slice(self.system.residual_vector());
        self.x.clear();
        self.x.extend_from_slice(self.system.solution_vector());
        let n = self.system.local_size();
        if self.rhs.len() != n || self.x.len() != n {
            return Err(LinearSolverError::DimensionMismatch {
                message: format!(
                    "system '{}' has local size {}, residual {}, solution {}",
                    self.system.name(),
                    n,
                    self.rhs.len(),
                    self.x.len()
                ),
            });
        }

        let outcome = self.run(&settings)?;
        self.report("newton", &outcome);

        let update = self.system.newton_update_mut();
        if update.len() != self.x.len() {
            return Err(LinearSolverError::DimensionMismatch {
                message: format!(
                    "newton update has length {}, expected {}",
                    update.len(),
                    self.x.len()
                ),
            });
        }
        for (u, x) in update.iter_mut().zip(&self.x) {
            *u = -x;
        }
        Ok(LinearSolution::from_krylov(&self.x, &outcome))
    }
}

impl<S: CoupledSystem + ?Sized> LinearSolver for DistributedKrylov<'_, S> {
    /// Nested format only. Pairs without a dependence path are left out of
    /// the mapping.
    fn calc_gradient(
        &mut self,
        inputs: &[Direction],
        outputs: &[Direction],
        format: ReturnFormat,
    ) -> Result<JacobianResult> {
        if format != ReturnFormat::Dict {
            return Err(LinearSolverError::UnsupportedFormat {
                format: format.to_string(),
            });
        }
        let ins = whole_variables(inputs)?;
        let outs = whole_variables(outputs)?;
        for name in ins.iter().chain(&outs) {
            self.global_size(name)?;
        }
        self.settings(&self.options())?;

        let mode = self.system.mode();
        debug!(
            system = self.system.name(),
            %mode,
            inputs = ins.len(),
            outputs = outs.len(),
            "distributed gradient"
        );

        // Only names matter for a nested result.
        let in_vars: Vec<ResolvedVar<'_>> = ins.iter().map(|&name| unplaced(name)).collect();
        let out_vars: Vec<ResolvedVar<'_>> = outs.iter().map(|&name| unplaced(name)).collect();
        let mut assembler = GradientAssembler::new(mode, format, &in_vars, &out_vars);

        let (drive, others) = match mode {
            DerivativeMode::Forward => (&ins, &outs),
            DerivativeMode::Adjoint => (&outs, &ins),
        };
        for &param in drive.iter() {
            let param_size = self.global_size(param)?;
            for local in 0..param_size {
                let (solvec, converged) =
                    self.compute_directional_derivative(param, local, others)?;
                assembler.record_convergence(converged);
                for &other in others.iter() {
                    match solvec.get(other) {
                        Some(values) => assembler.fill_block(param, param_size, local, other, values),
                        None => assembler.omit(param, other),
                    }
                }
            }
        }
        Ok(assembler.finish())
    }

    fn solve(&mut self, rhs: &DVector<f64>) -> Result<LinearSolution> {
        check_rhs(&*self.system, rhs)?;
        let settings = self.settings(&self.options())?;
        self.rhs.clear();
        self.rhs.extend_from_slice(rhs.as_slice());
        self.x.clear();
        self.x.resize(rhs.len(), 0.0);
        let outcome = self.run(&settings)?;
        self.report("linear solve", &outcome);
        Ok(LinearSolution::from_krylov(&self.x, &outcome))
    }
}

fn unplaced(name: &str) -> ResolvedVar<'_> {
    ResolvedVar {
        name,
        range: IndexRange::default(),
    }
}

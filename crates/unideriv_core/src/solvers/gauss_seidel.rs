//! Linear block Gauss-Seidel over a system's local partitions.
//!
//! Serial block solve of `D x = b − (L + U) x`: each sweep solves every
//! partition's diagonal block against the right-hand side less the coupling
//! to the other partitions, using the freshest state available.

use nalgebra::DVector;
use std::collections::BTreeSet;
use tracing::{debug, error, trace};

use super::{check_rhs, drive_directions, resolve_directions, LinearSolution, LinearSolver};
use crate::direction::Direction;
use crate::error::{LinearSolverError, Result};
use crate::jacobian::{JacobianResult, ReturnFormat};
use crate::operator::ConvergenceMonitor;
use crate::options::{DerivativeMode, SolverOptions};
use crate::traits::{CoupledSystem, PartitionId};

pub struct LinearGaussSeidel<'a, S: CoupledSystem + ?Sized> {
    system: &'a mut S,
    options: Option<SolverOptions>,
    /// Externally supplied right-hand side of the current solve.
    rhs: Vec<f64>,
    /// Adjoint accumulator for the active partition.
    work: Vec<f64>,
}

impl<'a, S: CoupledSystem + ?Sized> LinearGaussSeidel<'a, S> {
    pub fn new(system: &'a mut S) -> Self {
        let n = system.local_size();
        Self {
            system,
            options: None,
            rhs: vec![0.0; n],
            work: vec![0.0; n],
        }
    }

    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn options(&self) -> SolverOptions {
        self.options.unwrap_or_else(|| self.system.options())
    }

    fn partition_options(&self, partition: PartitionId, options: &SolverOptions) -> SolverOptions {
        self.system.partition_options(partition).unwrap_or(*options)
    }

    fn forward_sweep(&mut self, partitions: &[PartitionId], options: &SolverOptions) -> Result<()> {
        let all = self.system.active_variables();
        for &p in partitions {
            self.system.scatter(p)?;
            self.system.rhs_vector_mut().fill(0.0);
            self.system.apply_partition_jacobian(p, &all)?;
            for (r, b) in self.system.rhs_vector_mut().iter_mut().zip(&self.rhs) {
                *r = b - *r;
            }
            let sub = self.partition_options(p, options);
            self.system.solve_partition(p, &sub)?;
        }
        Ok(())
    }

    fn adjoint_sweep(&mut self, partitions: &[PartitionId], options: &SolverOptions) -> Result<()> {
        let reversed: Vec<PartitionId> = partitions.iter().rev().copied().collect();
        for &p in &reversed {
            let active: BTreeSet<String> = self.system.partition_variables(p);
            self.work.copy_from_slice(&self.rhs);
            for &q in reversed.iter().filter(|&&q| q != p) {
                self.system.rhs_vector_mut().fill(0.0);
                self.system.apply_partition_jacobian(q, &active)?;
                self.system.scatter(q)?;
                self.system.clear_partials();
                for (w, r) in self.work.iter_mut().zip(self.system.rhs_vector()) {
                    *w -= r;
                }
            }
            self.system.rhs_vector_mut().copy_from_slice(&self.work);
            let sub = self.partition_options(p, options);
            self.system.solve_partition(p, &sub)?;
        }
        Ok(())
    }
}

impl<S: CoupledSystem + ?Sized> LinearSolver for LinearGaussSeidel<'_, S> {
    fn calc_gradient(
        &mut self,
        inputs: &[Direction],
        outputs: &[Direction],
        format: ReturnFormat,
    ) -> Result<JacobianResult> {
        let ins = resolve_directions(&*self.system, inputs)?;
        let outs = resolve_directions(&*self.system, outputs)?;
        self.options().validate()?;

        let mode = self.system.mode();
        let n = self.system.local_size();
        drive_directions(mode, format, &ins, &outs, n, |rhs| {
            self.system.clear_partials();
            self.system.solution_vector_mut().fill(0.0);
            self.solve(rhs)
        })
    }

    /// Sweeps until `‖r‖ ≤ atol`, `‖r‖/‖r₀‖ ≤ rtol` or the iteration limit,
    /// starting from the system's current solution vector.
    fn solve(&mut self, rhs: &DVector<f64>) -> Result<LinearSolution> {
        check_rhs(&*self.system, rhs)?;
        let options = self.options();
        options.validate()?;

        let partitions = self.system.local_partitions();
        if partitions.is_empty() {
            return Err(LinearSolverError::NoPartitions {
                system: self.system.name().to_string(),
            });
        }

        let n = self.system.local_size();
        self.rhs.clear();
        self.rhs.extend_from_slice(rhs.as_slice());
        self.work.resize(n, 0.0);

        let mode = self.system.mode();
        let norm0 = ConvergenceMonitor::residual_norm(&mut *self.system, &self.rhs)?;
        let mut norm = norm0;
        let mut iterations = 0;
        let done = |norm: f64| {
            norm <= options.absolute_tolerance
                || norm0 == 0.0
                || norm / norm0 <= options.relative_tolerance
        };

        while iterations < options.max_iterations && !done(norm) {
            match mode {
                DerivativeMode::Forward => self.forward_sweep(&partitions, &options)?,
                DerivativeMode::Adjoint => self.adjoint_sweep(&partitions, &options)?,
            }
            norm = ConvergenceMonitor::residual_norm(&mut *self.system, &self.rhs)?;
            iterations += 1;
            trace!(iteration = iterations, residual = norm, "Gauss-Seidel sweep");
        }

        let converged = done(norm);
        if converged {
            debug!(system = self.system.name(), iterations, residual = norm, "Gauss-Seidel converged");
        } else {
            error!(
                system = self.system.name(),
                iterations,
                residual = norm,
                "linear Gauss-Seidel in '{}' failed to converge after {} iterations",
                self.system.name(),
                iterations
            );
        }

        Ok(LinearSolution {
            x: DVector::from_column_slice(self.system.solution_vector()),
            iterations,
            residual_norm: norm,
            converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::directions;
    use crate::model::ModelBuilder;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn feed_forward(mode: DerivativeMode, swapped: bool) -> crate::model::SparseCoupledModel {
        let builder = ModelBuilder::new("feed")
            .mode(mode)
            .options(SolverOptions::default().with_max_iterations(1))
            .parameter("x", 1)
            .explicit("y", 1, &[("x", 2.0)]);
        let builder = if swapped {
            builder.partition("comp", &["y"]).partition("params", &["x"])
        } else {
            builder.partition("params", &["x"]).partition("comp", &["y"])
        };
        builder.build().unwrap()
    }

    fn one_sweep_gradient(mode: DerivativeMode, swapped: bool) -> f64 {
        let mut model = feed_forward(mode, swapped);
        let mut solver = LinearGaussSeidel::new(&mut model);
        let result = solver
            .calc_gradient(&directions(["x"]), &directions(["y"]), ReturnFormat::Array)
            .unwrap();
        result.as_array().unwrap()[(0, 0)]
    }

    #[test]
    fn one_sweep_in_dependency_order_is_exact() {
        assert_relative_eq!(one_sweep_gradient(DerivativeMode::Forward, false), 2.0);
        assert_relative_eq!(one_sweep_gradient(DerivativeMode::Adjoint, false), 2.0);
    }

    #[test]
    fn sweep_order_matters_within_one_sweep() {
        assert_relative_eq!(one_sweep_gradient(DerivativeMode::Forward, true), 0.0);
        assert_relative_eq!(one_sweep_gradient(DerivativeMode::Adjoint, true), 0.0);
    }

    // u = 0.5 v + a, v = 0.25 u + b
    fn loop_model(options: SolverOptions) -> crate::model::SparseCoupledModel {
        ModelBuilder::new("loop")
            .options(options)
            .parameter("a", 1)
            .parameter("b", 1)
            .explicit("u", 1, &[("a", 1.0)])
            .explicit("v", 1, &[("b", 1.0)])
            .partial("u", "v", DMatrix::from_element(1, 1, -0.5))
            .partial("v", "u", DMatrix::from_element(1, 1, -0.25))
            .partition("params", &["a", "b"])
            .partition("first", &["u"])
            .partition("second", &["v"])
            .build()
            .unwrap()
    }

    #[test]
    fn coupled_partitions_converge() {
        let mut model = loop_model(SolverOptions::default().with_max_iterations(200));
        let expected = DMatrix::from_row_slice(2, 2, &[8.0 / 7.0, 4.0 / 7.0, 2.0 / 7.0, 8.0 / 7.0]);
        for mode in [DerivativeMode::Forward, DerivativeMode::Adjoint] {
            model.set_mode(mode);
            let mut solver = LinearGaussSeidel::new(&mut model);
            let result = solver
                .calc_gradient(&directions(["a", "b"]), &directions(["u", "v"]), ReturnFormat::Array)
                .unwrap();
            assert!(result.converged, "{mode}");
            assert_relative_eq!(result.as_array().unwrap(), &expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn relative_tolerance_stops_the_sweeps() {
        // Each forward sweep shrinks the residual by 1/8: 1/64 > 1e-2 > 1/512.
        let options = SolverOptions::default()
            .with_max_iterations(200)
            .with_absolute_tolerance(0.0)
            .with_relative_tolerance(1e-2);
        let mut model = loop_model(options);
        let rhs = DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0]);
        let sol = LinearGaussSeidel::new(&mut model).solve(&rhs).unwrap();
        assert!(sol.converged);
        assert_eq!(sol.iterations, 3);
        assert_relative_eq!(sol.residual_norm, 1.0 / 512.0, epsilon = 1e-15);

        // The default absolute tolerance alone needs many more sweeps.
        let mut model = loop_model(SolverOptions::default().with_max_iterations(200));
        let sol = LinearGaussSeidel::new(&mut model).solve(&rhs).unwrap();
        assert!(sol.converged);
        assert!(sol.iterations > 3);
    }

    #[test]
    fn zero_initial_residual_returns_immediately() {
        let mut model = feed_forward(DerivativeMode::Forward, false);
        let mut solver = LinearGaussSeidel::new(&mut model);
        let sol = solver.solve(&DVector::zeros(2)).unwrap();
        assert!(sol.converged);
        assert_eq!(sol.iterations, 0);
        drop(solver);
        assert_eq!(model.jacobian_applications(), 1);
    }

    #[test]
    fn solve_warm_starts_from_the_current_solution() {
        let mut model = feed_forward(DerivativeMode::Forward, false);
        model.solution_vector_mut().copy_from_slice(&[1.0, 2.0]);
        let mut solver = LinearGaussSeidel::new(&mut model);
        let sol = solver.solve(&DVector::from_vec(vec![1.0, 0.0])).unwrap();
        assert_eq!(sol.iterations, 0);
        assert_eq!(sol.x.as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn system_without_partitions_is_an_error() {
        let mut model = ModelBuilder::new("flat").parameter("x", 1).build().unwrap();
        let mut solver = LinearGaussSeidel::new(&mut model);
        let err = solver.solve(&DVector::from_vec(vec![1.0])).expect_err("no partitions");
        assert!(matches!(err, LinearSolverError::NoPartitions { .. }));
    }

    fn shift_model(partition_options: Option<SolverOptions>) -> crate::model::SparseCoupledModel {
        let builder = ModelBuilder::new("shift")
            .options(SolverOptions::default().with_max_iterations(1))
            .variable("u", 3)
            .partial(
                "u",
                "u",
                DMatrix::from_fn(3, 3, |i, j| if j == (i + 1) % 3 { 1.0 } else { 0.0 }),
            );
        match partition_options {
            Some(options) => builder.partition_with_options("u", &["u"], options),
            None => builder.partition("u", &["u"]),
        }
        .build()
        .unwrap()
    }

    #[test]
    fn partition_override_reaches_the_local_solve() {
        let rhs = DVector::from_vec(vec![1.0, 0.0, 0.0]);

        // One GMRES iteration cannot invert a cyclic shift.
        let mut model = shift_model(None);
        let sol = LinearGaussSeidel::new(&mut model).solve(&rhs).unwrap();
        assert!(!sol.converged);
        assert_eq!(sol.iterations, 1);

        let mut model = shift_model(Some(SolverOptions::default()));
        let sol = LinearGaussSeidel::new(&mut model).solve(&rhs).unwrap();
        assert!(sol.converged);
        assert_eq!(sol.iterations, 1);
        assert_relative_eq!(sol.x[1], 1.0, epsilon = 1e-9);
    }
}

use nalgebra::DVector;
use tracing::{debug, error};

use super::{check_rhs, drive_directions, resolve_directions, LinearSolution, LinearSolver};
use crate::direction::Direction;
use crate::error::Result;
use crate::jacobian::{JacobianResult, ReturnFormat};
use crate::krylov::{gmres, KrylovSettings, KrylovStatus};
use crate::operator::MatrixFreeOperator;
use crate::options::SolverOptions;
use crate::traits::CoupledSystem;

/// Serial restarted GMRES over the system's matrix-free operator.
///
/// Stops on the absolute tolerance only. Not for distributed systems: the
/// operator's inner products are still collective, but the one-hot seeding
/// assumes every requested variable is local.
pub struct GmresSolver<'a, S: CoupledSystem + ?Sized> {
    system: &'a mut S,
    options: Option<SolverOptions>,
    x: Vec<f64>,
}

impl<'a, S: CoupledSystem + ?Sized> GmresSolver<'a, S> {
    pub fn new(system: &'a mut S) -> Self {
        let n = system.local_size();
        Self {
            system,
            options: None,
            x: vec![0.0; n],
        }
    }

    /// Overrides the options the system supplies.
    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn options(&self) -> SolverOptions {
        self.options.unwrap_or_else(|| self.system.options())
    }
}

impl<S: CoupledSystem + ?Sized> LinearSolver for GmresSolver<'_, S> {
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
        debug!(
            system = self.system.name(),
            %mode,
            %format,
            inputs = ins.len(),
            outputs = outs.len(),
            "GMRES gradient"
        );
        drive_directions(mode, format, &ins, &outs, n, |rhs| self.solve(rhs))
    }

    fn solve(&mut self, rhs: &DVector<f64>) -> Result<LinearSolution> {
        check_rhs(&*self.system, rhs)?;
        let options = self.options();
        options.validate()?;

        let n = self.system.local_size();
        self.x.clear();
        self.x.resize(n, 0.0);

        let mut op = MatrixFreeOperator::new(&mut *self.system);
        let outcome = gmres(
            &mut op,
            rhs.as_slice(),
            &mut self.x,
            &KrylovSettings::absolute(&options),
        )?;

        match outcome.status {
            KrylovStatus::Converged => {}
            KrylovStatus::MaxIterations => error!(
                system = self.system.name(),
                iterations = outcome.iterations,
                residual = outcome.residual_norm,
                "ERROR in calc_gradient in '{}': gmres failed to converge after {} iterations",
                self.system.name(),
                outcome.iterations
            ),
            KrylovStatus::Breakdown => error!(
                system = self.system.name(),
                residual = outcome.residual_norm,
                "ERROR in calc_gradient in '{}': gmres failed",
                self.system.name()
            ),
        }
        Ok(LinearSolution::from_krylov(&self.x, &outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::directions;
    use crate::error::LinearSolverError;
    use crate::model::ModelBuilder;
    use crate::options::DerivativeMode;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn pair() -> ModelBuilder {
        ModelBuilder::new("pair")
            .parameter("x1", 1)
            .parameter("x2", 1)
            .explicit("y1", 1, &[("x1", 2.0), ("x2", 1.0)])
            .explicit("y2", 1, &[("x1", 1.0), ("x2", 3.0)])
    }

    #[test]
    fn forward_gradient_matches_the_linear_map() {
        let mut model = pair().build().unwrap();
        let mut solver = GmresSolver::new(&mut model);
        let result = solver
            .calc_gradient(
                &directions(["x1", "x2"]),
                &directions(["y1", "y2"]),
                ReturnFormat::Array,
            )
            .unwrap();
        assert!(result.converged);
        let expected = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        assert_relative_eq!(result.as_array().unwrap(), &expected, epsilon = 1e-6);
    }

    #[test]
    fn adjoint_gradient_keeps_the_orientation() {
        let mut model = pair().mode(DerivativeMode::Adjoint).build().unwrap();
        let mut solver = GmresSolver::new(&mut model);
        let result = solver
            .calc_gradient(
                &directions(["x1", "x2"]),
                &directions(["y1", "y2"]),
                ReturnFormat::Array,
            )
            .unwrap();
        let expected = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        assert_relative_eq!(result.as_array().unwrap(), &expected, epsilon = 1e-6);
        assert_relative_eq!(result.as_array().unwrap()[(0, 1)], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn slice_fails_before_any_product() {
        let mut model = pair().build().unwrap();
        let mut solver = GmresSolver::new(&mut model);
        let err = solver
            .calc_gradient(
                &[Direction::sliced("x1", vec![0, 2])],
                &directions(["y1"]),
                ReturnFormat::Dict,
            )
            .expect_err("slice");
        assert!(matches!(err, LinearSolverError::UnsupportedSlice { .. }));
        drop(solver);
        assert_eq!(model.jacobian_applications(), 0);
    }

    #[test]
    fn zero_jacobian_reports_non_convergence() {
        let mut model = ModelBuilder::new("zero").variable("u", 2).build().unwrap();
        let mut solver = GmresSolver::new(&mut model);
        let sol = solver.solve(&DVector::from_vec(vec![1.0, 0.0])).unwrap();
        assert!(!sol.converged);
        assert_relative_eq!(sol.residual_norm, 1.0);
    }

    #[test]
    fn rhs_length_is_checked() {
        let mut model = pair().build().unwrap();
        let mut solver = GmresSolver::new(&mut model);
        assert!(matches!(
            solver.solve(&DVector::zeros(3)),
            Err(LinearSolverError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn option_override_limits_iterations() {
        let mut model = ModelBuilder::new("shift")
            .variable("u", 4)
            .partial(
                "u",
                "u",
                DMatrix::from_fn(4, 4, |i, j| if j == (i + 1) % 4 { 1.0 } else { 0.0 }),
            )
            .build()
            .unwrap();
        let mut solver = GmresSolver::new(&mut model)
            .with_options(SolverOptions::default().with_max_iterations(2));
        let sol = solver
            .solve(&DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        assert!(!sol.converged);
        assert_eq!(sol.iterations, 2);
    }
}

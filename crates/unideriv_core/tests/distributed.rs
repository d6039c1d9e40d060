use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use std::thread;
use unideriv_core::{
    directions, Communicator, CoupledSystem, DerivativeMode, DistributedKrylov, JacobianResult,
    LinearSolver, ModelBuilder, ReturnFormat, SerialCommunicator, SparseCoupledModel,
    ThreadCommunicator,
};

/// Runs `f` on every rank of an in-process group and returns the per-rank
/// results in rank order.
fn on_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ThreadCommunicator) -> T + Sync,
{
    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = ThreadCommunicator::group(size)
            .into_iter()
            .map(|comm| scope.spawn(move || f(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// y1 = 2 x1 + x2 and y2 = x1 + 3 x2. With two ranks, rank 0 owns x1 and y2,
/// rank 1 owns x2 and y1.
fn linear_pair(mode: DerivativeMode, ranks: usize) -> ModelBuilder {
    let other = ranks - 1;
    ModelBuilder::new("linear_pair")
        .mode(mode)
        .parameter_on("x1", 1, 0)
        .parameter_on("x2", 1, other)
        .explicit_on("y1", 1, other, &[("x1", 2.0), ("x2", 1.0)])
        .explicit_on("y2", 1, 0, &[("x1", 1.0), ("x2", 3.0)])
}

fn pair_gradient<C: Communicator>(model: &mut SparseCoupledModel<C>) -> JacobianResult {
    let mut solver = DistributedKrylov::new(model).unwrap();
    solver
        .calc_gradient(
            &directions(["x1", "x2"]),
            &directions(["y1", "y2"]),
            ReturnFormat::Dict,
        )
        .unwrap()
}

fn assert_pair(result: &JacobianResult) {
    assert!(result.converged);
    for (out, inp, value) in [
        ("y1", "x1", 2.0),
        ("y1", "x2", 1.0),
        ("y2", "x1", 1.0),
        ("y2", "x2", 3.0),
    ] {
        assert_relative_eq!(result.block(out, inp).unwrap()[(0, 0)], value, epsilon = 1e-6);
    }
}

#[test]
fn linear_pair_on_one_rank() {
    for mode in [DerivativeMode::Forward, DerivativeMode::Adjoint] {
        let mut model = linear_pair(mode, 1).build_with(SerialCommunicator).unwrap();
        assert_pair(&pair_gradient(&mut model));
    }
}

#[test]
fn linear_pair_on_two_ranks() {
    for mode in [DerivativeMode::Forward, DerivativeMode::Adjoint] {
        let results = on_ranks(2, |comm| {
            let mut model = linear_pair(mode, 2).build_with(comm).unwrap();
            assert_eq!(model.local_sizes(), vec![2, 2]);
            pair_gradient(&mut model)
        });
        for result in &results {
            assert_pair(result);
        }
        assert_eq!(results[0], results[1]);
    }
}

#[test]
fn wide_variables_on_different_ranks() {
    // y = M x with x (size 2) on rank 0 and y (size 3) on rank 1.
    let m = DMatrix::from_row_slice(3, 2, &[1.0, -2.0, 0.5, 4.0, 3.0, 0.0]);
    for mode in [DerivativeMode::Adjoint, DerivativeMode::Forward] {
        let results = on_ranks(2, |comm| {
            let mut model = ModelBuilder::new("wide")
                .mode(mode)
                .parameter_on("x", 2, 0)
                .variable_on("y", 3, 1)
                .partial("y", "y", DMatrix::identity(3, 3))
                .partial("y", "x", -m.clone())
                .build_with(comm)
                .unwrap();
            assert_eq!(model.local_sizes(), vec![2, 3]);
            let mut solver = DistributedKrylov::new(&mut model).unwrap();
            solver
                .calc_gradient(&directions(["x"]), &directions(["y"]), ReturnFormat::Dict)
                .unwrap()
        });
        for result in &results {
            assert!(result.converged, "{mode}");
            let block = result.block("y", "x").unwrap();
            assert_eq!(block.shape(), (3, 2));
            assert_relative_eq!(block, &m, epsilon = 1e-9);
        }
        assert_eq!(results[0], results[1]);
    }
}

#[test]
fn reachable_zero_is_kept_and_unreachable_pair_dropped() {
    // z = y - x with y = x: a dependence path, zero derivative.
    let build = |comm: ThreadCommunicator| {
        ModelBuilder::new("paths")
            .parameter_on("x", 1, 0)
            .parameter_on("w", 1, 1)
            .explicit_on("y", 1, 1, &[("x", 1.0)])
            .explicit_on("z", 1, 0, &[("y", 1.0), ("x", -1.0)])
            .build_with(comm)
            .unwrap()
    };
    let results = on_ranks(2, |comm| {
        let mut model = build(comm);
        let mut solver = DistributedKrylov::new(&mut model).unwrap();
        solver
            .calc_gradient(&directions(["x", "w"]), &directions(["z"]), ReturnFormat::Dict)
            .unwrap()
    });
    for result in &results {
        assert!(result.has_entry("z", "x"));
        assert_relative_eq!(result.block("z", "x").unwrap()[(0, 0)], 0.0, epsilon = 1e-9);
        assert!(!result.has_entry("z", "w"));
    }
}

#[test]
fn newton_step_across_ranks() {
    let residual = [[0.5, -1.0], [2.0, 0.25]];
    let pieces = on_ranks(2, |comm| {
        let rank = comm.rank();
        let mut model = linear_pair(DerivativeMode::Forward, 2).build_with(comm).unwrap();
        model.set_residual(&residual[rank]).unwrap();
        let step = DistributedKrylov::new(&mut model).unwrap().newton().unwrap();
        assert!(step.converged);
        (
            model.newton_update().to_vec(),
            DMatrix::from(model.residual_jacobian()),
        )
    });

    // Global layout is rank 0's variables, then rank 1's.
    let update: Vec<f64> = pieces.iter().flat_map(|(u, _)| u.clone()).collect();
    let f: Vec<f64> = residual.iter().flatten().copied().collect();
    let jacobian = &pieces[0].1;
    let lhs = jacobian * DVector::from_vec(update);
    assert_relative_eq!(lhs, -DVector::from_vec(f), epsilon = 1e-8);
}

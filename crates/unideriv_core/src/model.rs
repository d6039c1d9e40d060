//! A coupled system backed by a sparse residual Jacobian.
//!
//! `SparseCoupledModel` is a reference implementation of [`CoupledSystem`]:
//! it holds `∂R/∂u` for the whole system as a CSR matrix and evaluates the
//! products the solvers ask for, forward or transposed, without the solvers
//! ever seeing the matrix. Explicit components `y = F(x)` contribute the rows
//! `R_y = y − F(x)`; parameters contribute identity rows.
//!
//! Variables are owned whole by one rank. Each rank's variables are contiguous
//! in the global ordering, rank 0 first, so a rank's local state vector is one
//! slice of the global one.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::warn;

use crate::comm::{Communicator, SerialCommunicator};
use crate::direction::IndexRange;
use crate::krylov::{gmres, DenseOperator, KrylovSettings};
use crate::options::{DerivativeMode, SolverOptions};
use crate::traits::{CoupledSystem, PartitionId};

#[derive(Debug, Clone)]
struct VariableInfo {
    name: String,
    size: usize,
    rank: usize,
    global_offset: usize,
}

#[derive(Debug, Clone)]
struct PartitionSpec {
    name: String,
    variables: BTreeSet<String>,
    options: Option<SolverOptions>,
    /// Local offsets of the partition's variables.
    local: Vec<usize>,
}

/// Declarative construction of a [`SparseCoupledModel`].
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    mode: DerivativeMode,
    options: SolverOptions,
    variables: Vec<(String, usize, usize)>,
    blocks: Vec<(String, String, DMatrix<f64>)>,
    partitions: Vec<(String, Vec<String>, Option<SolverOptions>)>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: DerivativeMode::Forward,
            options: SolverOptions::default(),
            variables: Vec::new(),
            blocks: Vec::new(),
            partitions: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: DerivativeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Declares a state variable on rank 0 without any residual rows.
    pub fn variable(self, name: &str, size: usize) -> Self {
        self.variable_on(name, size, 0)
    }

    pub fn variable_on(mut self, name: &str, size: usize, rank: usize) -> Self {
        self.variables.push((name.to_string(), size, rank));
        self
    }

    /// Adds a raw block `∂R_of/∂wrt`. Repeated blocks accumulate.
    pub fn partial(mut self, of: &str, wrt: &str, block: DMatrix<f64>) -> Self {
        self.blocks.push((of.to_string(), wrt.to_string(), block));
        self
    }

    /// An independent variable: identity residual rows.
    pub fn parameter(self, name: &str, size: usize) -> Self {
        self.parameter_on(name, size, 0)
    }

    pub fn parameter_on(self, name: &str, size: usize, rank: usize) -> Self {
        self.variable_on(name, size, rank)
            .partial(name, name, DMatrix::identity(size, size))
    }

    /// An explicit output `y = Σ c·x` over same-sized inputs.
    pub fn explicit(self, name: &str, size: usize, inputs: &[(&str, f64)]) -> Self {
        self.explicit_on(name, size, 0, inputs)
    }

    pub fn explicit_on(
        mut self,
        name: &str,
        size: usize,
        rank: usize,
        inputs: &[(&str, f64)],
    ) -> Self {
        self = self
            .variable_on(name, size, rank)
            .partial(name, name, DMatrix::identity(size, size));
        for (input, coeff) in inputs {
            self = self.partial(name, input, DMatrix::identity(size, size) * -*coeff);
        }
        self
    }

    /// Appends a partition; partitions sweep in the order they are added.
    pub fn partition(self, name: &str, variables: &[&str]) -> Self {
        self.partition_entry(name, variables, None)
    }

    pub fn partition_with_options(
        self,
        name: &str,
        variables: &[&str],
        options: SolverOptions,
    ) -> Self {
        self.partition_entry(name, variables, Some(options))
    }

    fn partition_entry(
        mut self,
        name: &str,
        variables: &[&str],
        options: Option<SolverOptions>,
    ) -> Self {
        self.partitions.push((
            name.to_string(),
            variables.iter().map(|v| v.to_string()).collect(),
            options,
        ));
        self
    }

    pub fn build(self) -> Result<SparseCoupledModel<SerialCommunicator>> {
        self.build_with(SerialCommunicator)
    }

    /// Builds this rank's view of the model. Every rank must build from the
    /// same declarations.
    pub fn build_with<C: Communicator>(self, comm: C) -> Result<SparseCoupledModel<C>> {
        let ranks = comm.size();
        let rank = comm.rank();

        let mut seen = BTreeSet::new();
        for (name, size, owner) in &self.variables {
            if !seen.insert(name.clone()) {
                bail!("Variable '{}' declared twice.", name);
            }
            if *size == 0 {
                bail!("Variable '{}' has zero size.", name);
            }
            if *owner >= ranks {
                bail!(
                    "Variable '{}' assigned to rank {} of a {}-rank group.",
                    name,
                    owner,
                    ranks
                );
            }
        }

        let mut local_sizes = vec![0usize; ranks];
        for (_, size, owner) in &self.variables {
            local_sizes[*owner] += size;
        }
        let rank_offsets: Vec<usize> = local_sizes
            .iter()
            .scan(0, |acc, s| {
                let start = *acc;
                *acc += s;
                Some(start)
            })
            .collect();

        let mut cursor = rank_offsets.clone();
        let mut variables = Vec::with_capacity(self.variables.len());
        let mut by_name = BTreeMap::new();
        for (name, size, owner) in &self.variables {
            by_name.insert(name.clone(), variables.len());
            variables.push(VariableInfo {
                name: name.clone(),
                size: *size,
                rank: *owner,
                global_offset: cursor[*owner],
            });
            cursor[*owner] += size;
        }
        let n_global: usize = local_sizes.iter().sum();

        let mut coo = CooMatrix::new(n_global, n_global);
        let mut coupling: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (of, wrt, block) in &self.blocks {
            let row_var = lookup(&variables, &by_name, of)?;
            let col_var = lookup(&variables, &by_name, wrt)?;
            if block.nrows() != row_var.size || block.ncols() != col_var.size {
                bail!(
                    "Partial d{}/d{} has shape {}x{}, expected {}x{}.",
                    of,
                    wrt,
                    block.nrows(),
                    block.ncols(),
                    row_var.size,
                    col_var.size
                );
            }
            let mut nonzero = false;
            for i in 0..block.nrows() {
                for j in 0..block.ncols() {
                    let v = block[(i, j)];
                    if v != 0.0 {
                        coo.push(row_var.global_offset + i, col_var.global_offset + j, v);
                        nonzero = true;
                    }
                }
            }
            if nonzero && of != wrt {
                coupling.entry(wrt.clone()).or_default().insert(of.clone());
            }
        }
        let jacobian = CsrMatrix::from(&coo);

        let mut partitions = Vec::with_capacity(self.partitions.len());
        let mut claimed = BTreeSet::new();
        for (name, vars, options) in self.partitions {
            let mut local = Vec::new();
            for var in &vars {
                let info = lookup(&variables, &by_name, var)
                    .with_context(|| format!("Partition '{}' is invalid.", name))?;
                if info.rank != rank {
                    bail!(
                        "Partition '{}' holds '{}', which lives on rank {}, not rank {}.",
                        name,
                        var,
                        info.rank,
                        rank
                    );
                }
                if !claimed.insert(var.clone()) {
                    bail!("Variable '{}' belongs to more than one partition.", var);
                }
                let start = info.global_offset - rank_offsets[rank];
                local.extend(start..start + info.size);
            }
            partitions.push(PartitionSpec {
                name,
                variables: vars.into_iter().collect(),
                options,
                local,
            });
        }

        let reach = reachability(&variables, &coupling);
        let n_local = local_sizes[rank];

        Ok(SparseCoupledModel {
            name: self.name,
            mode: self.mode,
            options: self.options,
            comm,
            variables,
            by_name,
            local_sizes,
            rank_offset: rank_offsets[rank],
            jacobian,
            partitions,
            reach,
            solution: DVector::zeros(n_local),
            rhs: DVector::zeros(n_local),
            params: DVector::zeros(n_local),
            residual: DVector::zeros(n_local),
            newton_update: DVector::zeros(n_local),
            applications: 0,
        })
    }
}

fn lookup<'v>(
    variables: &'v [VariableInfo],
    by_name: &BTreeMap<String, usize>,
    name: &str,
) -> Result<&'v VariableInfo> {
    by_name
        .get(name)
        .map(|&i| &variables[i])
        .ok_or_else(|| anyhow!("Unknown variable '{}'.", name))
}

/// For every variable, the set of variables it reaches through couplings.
fn reachability(
    variables: &[VariableInfo],
    coupling: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut reach = BTreeMap::new();
    for var in variables {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([var.name.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(next) = coupling.get(&current) {
                for n in next {
                    if seen.insert(n.clone()) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }
        reach.insert(var.name.clone(), seen);
    }
    reach
}

/// Reference coupled system over a CSR residual Jacobian.
#[derive(Debug)]
pub struct SparseCoupledModel<C: Communicator = SerialCommunicator> {
    name: String,
    mode: DerivativeMode,
    options: SolverOptions,
    comm: C,
    variables: Vec<VariableInfo>,
    by_name: BTreeMap<String, usize>,
    local_sizes: Vec<usize>,
    rank_offset: usize,
    jacobian: CsrMatrix<f64>,
    partitions: Vec<PartitionSpec>,
    reach: BTreeMap<String, BTreeSet<String>>,
    solution: DVector<f64>,
    rhs: DVector<f64>,
    /// Parameter-side view: sibling state in forward sweeps, transposed
    /// contributions awaiting a reverse scatter in adjoint sweeps.
    params: DVector<f64>,
    residual: DVector<f64>,
    newton_update: DVector<f64>,
    applications: usize,
}

impl<C: Communicator> SparseCoupledModel<C> {
    pub fn set_mode(&mut self, mode: DerivativeMode) {
        self.mode = mode;
    }

    /// Sets the nonlinear residual a Newton step will null.
    pub fn set_residual(&mut self, residual: &[f64]) -> Result<()> {
        if residual.len() != self.residual.len() {
            bail!(
                "Residual has length {}, expected {}.",
                residual.len(),
                self.residual.len()
            );
        }
        self.residual.copy_from_slice(residual);
        Ok(())
    }

    pub fn newton_update(&self) -> &[f64] {
        self.newton_update.as_slice()
    }

    /// Global residual Jacobian, for checking results against.
    pub fn residual_jacobian(&self) -> &CsrMatrix<f64> {
        &self.jacobian
    }

    /// Number of Jacobian-vector products evaluated so far.
    pub fn jacobian_applications(&self) -> usize {
        self.applications
    }

    fn local_range(&self) -> std::ops::Range<usize> {
        self.rank_offset..self.rank_offset + self.solution.len()
    }

    /// Global-index mask of the named variables.
    fn mask(&self, vars: &BTreeSet<String>) -> Vec<bool> {
        let mut mask = vec![false; self.jacobian.nrows()];
        for name in vars {
            if let Some(&i) = self.by_name.get(name) {
                let info = &self.variables[i];
                mask[info.global_offset..info.global_offset + info.size].fill(true);
            }
        }
        mask
    }

    /// Assembles the full global vector from every rank's local piece.
    fn gather_global(&self, local: &[f64]) -> Result<Vec<f64>> {
        let mut global = vec![0.0; self.jacobian.nrows()];
        global[self.local_range()].copy_from_slice(local);
        self.comm.all_reduce_sum(&mut global)?;
        Ok(global)
    }

    fn partition(&self, partition: PartitionId) -> Result<&PartitionSpec> {
        self.partitions
            .get(partition.0)
            .ok_or_else(|| anyhow!("Unknown partition {:?} in '{}'.", partition, self.name))
    }
}

impl<C: Communicator> CoupledSystem for SparseCoupledModel<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> DerivativeMode {
        self.mode
    }

    fn options(&self) -> SolverOptions {
        self.options
    }

    fn local_size(&self) -> usize {
        self.solution.len()
    }

    fn solution_vector(&self) -> &[f64] {
        self.solution.as_slice()
    }

    fn solution_vector_mut(&mut self) -> &mut [f64] {
        self.solution.as_mut_slice()
    }

    fn rhs_vector(&self) -> &[f64] {
        self.rhs.as_slice()
    }

    fn rhs_vector_mut(&mut self) -> &mut [f64] {
        self.rhs.as_mut_slice()
    }

    fn clear_partials(&mut self) {
        self.params.fill(0.0);
    }

    fn active_variables(&self) -> BTreeSet<String> {
        self.by_name.keys().cloned().collect()
    }

    fn apply_jacobian(&mut self, vars: &BTreeSet<String>) -> Result<()> {
        self.applications += 1;
        let mask = self.mask(vars);
        let x = self.gather_global(self.solution.as_slice())?;
        let local = self.local_range();
        let offset = self.rank_offset;

        match self.mode {
            DerivativeMode::Forward => {
                for r in local {
                    if !mask[r] {
                        continue;
                    }
                    let row = self.jacobian.row(r);
                    let sum: f64 = row
                        .col_indices()
                        .iter()
                        .zip(row.values())
                        .filter(|(c, _)| mask[**c])
                        .map(|(c, v)| v * x[*c])
                        .sum();
                    self.rhs[r - offset] += sum;
                }
            }
            DerivativeMode::Adjoint => {
                for r in 0..self.jacobian.nrows() {
                    if !mask[r] || x[r] == 0.0 {
                        continue;
                    }
                    let row = self.jacobian.row(r);
                    for (c, v) in row.col_indices().iter().zip(row.values()) {
                        if mask[*c] && local.contains(c) {
                            self.rhs[*c - offset] += v * x[r];
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_indices(&self, name: &str) -> Option<IndexRange> {
        let info = &self.variables[*self.by_name.get(name)?];
        if info.rank != self.comm.rank() {
            return Some(IndexRange::default());
        }
        Some(IndexRange::contiguous(
            info.global_offset - self.rank_offset,
            info.size,
        ))
    }

    fn local_partitions(&self) -> Vec<PartitionId> {
        (0..self.partitions.len()).map(PartitionId).collect()
    }

    fn partition_variables(&self, partition: PartitionId) -> BTreeSet<String> {
        self.partitions
            .get(partition.0)
            .map(|p| p.variables.clone())
            .unwrap_or_default()
    }

    fn partition_options(&self, partition: PartitionId) -> Option<SolverOptions> {
        self.partitions.get(partition.0).and_then(|p| p.options)
    }

    fn scatter(&mut self, partition: PartitionId) -> Result<()> {
        let owned: BTreeSet<usize> = self.partition(partition)?.local.iter().copied().collect();
        for i in 0..self.params.len() {
            if owned.contains(&i) {
                continue;
            }
            match self.mode {
                DerivativeMode::Forward => self.params[i] = self.solution[i],
                DerivativeMode::Adjoint => self.rhs[i] += self.params[i],
            }
        }
        Ok(())
    }

    fn apply_partition_jacobian(
        &mut self,
        partition: PartitionId,
        vars: &BTreeSet<String>,
    ) -> Result<()> {
        self.applications += 1;
        let mask = self.mask(vars);
        let rows = self.partition(partition)?.local.clone();
        let owned: BTreeSet<usize> = rows.iter().copied().collect();
        let local = self.local_range();
        let offset = self.rank_offset;

        for lr in rows {
            let row = self.jacobian.row(lr + offset);
            for (c, v) in row.col_indices().iter().zip(row.values()) {
                if !mask[*c] || !local.contains(c) || owned.contains(&(*c - offset)) {
                    continue;
                }
                let lc = *c - offset;
                match self.mode {
                    DerivativeMode::Forward => self.rhs[lr] += v * self.params[lc],
                    DerivativeMode::Adjoint => self.params[lc] += v * self.solution[lr],
                }
            }
        }
        Ok(())
    }

    fn solve_partition(&mut self, partition: PartitionId, options: &SolverOptions) -> Result<()> {
        let part = self.partition(partition)?;
        let idx = part.local.clone();
        let name = part.name.clone();
        let n = idx.len();

        let mut block = DMatrix::zeros(n, n);
        for (bi, &lr) in idx.iter().enumerate() {
            let row = self.jacobian.row(lr + self.rank_offset);
            for (c, v) in row.col_indices().iter().zip(row.values()) {
                if let Some(bj) = idx.iter().position(|&i| i + self.rank_offset == *c) {
                    block[(bi, bj)] = *v;
                }
            }
        }
        if self.mode == DerivativeMode::Adjoint {
            block.transpose_mut();
        }

        let b: Vec<f64> = idx.iter().map(|&i| self.rhs[i]).collect();
        let mut x = vec![0.0; n];
        let outcome = gmres(
            &mut DenseOperator::new(&block),
            &b,
            &mut x,
            &KrylovSettings::from_options(options),
        )
        .with_context(|| format!("Local solve of partition '{}' failed.", name))?;
        if !outcome.converged() {
            warn!(
                system = %self.name,
                partition = %name,
                iterations = outcome.iterations,
                residual = outcome.residual_norm,
                "partition solve did not converge"
            );
        }
        for (k, &i) in idx.iter().enumerate() {
            self.solution[i] = x[k];
        }
        Ok(())
    }

    fn communicator(&self) -> &dyn Communicator {
        &self.comm
    }

    fn local_sizes(&self) -> Vec<usize> {
        self.local_sizes.clone()
    }

    fn variable_size(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).map(|&i| self.variables[i].size)
    }

    fn depends_on(&self, of: &str, wrt: &str) -> bool {
        of == wrt || self.reach.get(wrt).is_some_and(|r| r.contains(of))
    }

    fn residual_vector(&self) -> &[f64] {
        self.residual.as_slice()
    }

    fn newton_update_mut(&mut self) -> &mut [f64] {
        self.newton_update.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ModelBuilder {
        ModelBuilder::new("chain")
            .parameter("x", 2)
            .explicit("y", 2, &[("x", 3.0)])
            .explicit("z", 2, &[("y", 0.5)])
            .parameter("w", 1)
    }

    #[test]
    fn builder_lays_out_variables_in_order() {
        let model = chain().build().unwrap();
        assert_eq!(model.local_size(), 7);
        assert_eq!(model.resolve_indices("y").unwrap(), IndexRange::contiguous(2, 2));
        assert_eq!(model.resolve_indices("w").unwrap(), IndexRange::contiguous(6, 1));
        assert!(model.resolve_indices("nope").is_none());
        assert_eq!(model.variable_size("z"), Some(2));
        assert_eq!(model.local_sizes(), vec![7]);
    }

    #[test]
    fn builder_rejects_bad_declarations() {
        let err = ModelBuilder::new("bad")
            .parameter("x", 1)
            .parameter("x", 1)
            .build()
            .expect_err("duplicate");
        assert!(format!("{err}").contains("declared twice"));

        let err = ModelBuilder::new("bad")
            .explicit("y", 1, &[("ghost", 1.0)])
            .build()
            .expect_err("unknown input");
        assert!(format!("{err}").contains("ghost"));

        let err = ModelBuilder::new("bad")
            .parameter("x", 2)
            .explicit("y", 1, &[])
            .partial("y", "x", DMatrix::zeros(1, 3))
            .build()
            .expect_err("shape");
        assert!(format!("{err}").contains("shape"));

        let err = ModelBuilder::new("bad")
            .parameter("x", 1)
            .partition("a", &["x"])
            .partition("b", &["x"])
            .build()
            .expect_err("overlap");
        assert!(format!("{err}").contains("more than one partition"));
    }

    #[test]
    fn dependence_follows_coupling_paths() {
        let model = chain().build().unwrap();
        assert!(model.depends_on("z", "x"));
        assert!(model.depends_on("y", "x"));
        assert!(model.depends_on("x", "x"));
        assert!(!model.depends_on("x", "z"));
        assert!(!model.depends_on("z", "w"));
    }

    #[test]
    fn adjoint_product_is_the_transpose() {
        let mut model = chain().build().unwrap();
        let vars = model.active_variables();
        let n = model.local_size();
        let mut forward = DMatrix::zeros(n, n);
        let mut adjoint = DMatrix::zeros(n, n);
        for j in 0..n {
            model.solution_vector_mut().fill(0.0);
            model.solution_vector_mut()[j] = 1.0;

            model.set_mode(DerivativeMode::Forward);
            model.rhs_vector_mut().fill(0.0);
            model.apply_jacobian(&vars).unwrap();
            forward.set_column(j, &DVector::from_column_slice(model.rhs_vector()));

            model.set_mode(DerivativeMode::Adjoint);
            model.rhs_vector_mut().fill(0.0);
            model.apply_jacobian(&vars).unwrap();
            adjoint.set_column(j, &DVector::from_column_slice(model.rhs_vector()));
        }
        assert_eq!(forward.transpose(), adjoint);
        assert_eq!(forward[(2, 0)], -3.0);
        assert_eq!(forward[(4, 2)], -0.5);
        assert_eq!(model.jacobian_applications(), 2 * n);
    }

    #[test]
    fn forward_partition_product_reads_scattered_state() {
        let mut model = ModelBuilder::new("pair")
            .parameter("x", 1)
            .explicit("y", 1, &[("x", 2.0)])
            .partition("params", &["x"])
            .partition("comp", &["y"])
            .build()
            .unwrap();
        let comp = model.local_partitions()[1];
        let vars = model.active_variables();
        model.solution_vector_mut().copy_from_slice(&[1.5, 0.0]);

        model.apply_partition_jacobian(comp, &vars).unwrap();
        assert_eq!(model.rhs_vector(), &[0.0, 0.0], "no scatter, no input state");

        model.scatter(comp).unwrap();
        model.apply_partition_jacobian(comp, &vars).unwrap();
        assert_eq!(model.rhs_vector(), &[0.0, -3.0]);
    }

    #[test]
    fn partition_solve_uses_the_diagonal_block() {
        let mut model = ModelBuilder::new("block")
            .variable("u", 2)
            .partial("u", "u", DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 4.0]))
            .partition("only", &["u"])
            .build()
            .unwrap();
        let p = model.local_partitions()[0];
        model.rhs_vector_mut().copy_from_slice(&[3.0, 4.0]);
        model.solve_partition(p, &SolverOptions::default()).unwrap();
        let x = model.solution_vector();
        assert!((x[0] - 1.0).abs() < 1e-10 && (x[1] - 1.0).abs() < 1e-10);

        model.set_mode(DerivativeMode::Adjoint);
        model.rhs_vector_mut().copy_from_slice(&[2.0, 5.0]);
        model.solve_partition(p, &SolverOptions::default()).unwrap();
        let x = model.solution_vector();
        assert!((x[0] - 1.0).abs() < 1e-10 && (x[1] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn residual_length_is_checked() {
        let mut model = chain().build().unwrap();
        assert!(model.set_residual(&[1.0]).is_err());
        assert!(model.set_residual(&[0.0; 7]).is_ok());
    }
}

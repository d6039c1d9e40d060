//! Jacobian result formats and their assembly from per-direction solves.
//!
//! Orientation is the same in both modes and both formats: rows follow the
//! outputs, columns follow the inputs. Adjoint solves fill rows, forward
//! solves fill columns.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::direction::IndexRange;
use crate::error::{LinearSolverError, Result};
use crate::options::DerivativeMode;

/// Requested shape of a gradient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReturnFormat {
    /// Dense `[output-flat-index, input-flat-index]` matrix.
    Array,
    /// Nested `output -> input -> block` mapping.
    Dict,
}

impl fmt::Display for ReturnFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnFormat::Array => write!(f, "array"),
            ReturnFormat::Dict => write!(f, "dict"),
        }
    }
}

impl FromStr for ReturnFormat {
    type Err = LinearSolverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "array" => Ok(ReturnFormat::Array),
            "dict" => Ok(ReturnFormat::Dict),
            other => Err(LinearSolverError::UnsupportedFormat {
                format: other.to_string(),
            }),
        }
    }
}

/// `output -> input -> block`. `None` marks a requested pair whose block was
/// never filled; pairs without any dependence path may be absent altogether.
pub type NestedJacobian = BTreeMap<String, BTreeMap<String, Option<DMatrix<f64>>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum JacobianValues {
    Array(DMatrix<f64>),
    Dict(NestedJacobian),
}

/// A gradient together with the convergence of the solves behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianResult {
    pub values: JacobianValues,
    /// False if any direction's solve stopped short of its tolerance. The
    /// values are then best-effort.
    pub converged: bool,
}

impl JacobianResult {
    pub fn as_array(&self) -> Option<&DMatrix<f64>> {
        match &self.values {
            JacobianValues::Array(m) => Some(m),
            JacobianValues::Dict(_) => None,
        }
    }

    pub fn as_dict(&self) -> Option<&NestedJacobian> {
        match &self.values {
            JacobianValues::Dict(d) => Some(d),
            JacobianValues::Array(_) => None,
        }
    }

    /// Block of `output` with respect to `input` in a nested result.
    pub fn block(&self, output: &str, input: &str) -> Option<&DMatrix<f64>> {
        self.as_dict()?.get(output)?.get(input)?.as_ref()
    }

    /// Whether a nested result holds a key for the pair, filled or not.
    pub fn has_entry(&self, output: &str, input: &str) -> bool {
        self.as_dict()
            .and_then(|d| d.get(output))
            .is_some_and(|row| row.contains_key(input))
    }
}

/// Nested mapping with every requested pair present and unfilled.
pub(crate) fn seeded_dict(outputs: &[&str], inputs: &[&str]) -> NestedJacobian {
    outputs
        .iter()
        .map(|o| {
            let row = inputs.iter().map(|i| (i.to_string(), None)).collect();
            (o.to_string(), row)
        })
        .collect()
}

/// A requested variable with its resolved local offsets.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedVar<'n> {
    pub name: &'n str,
    pub range: IndexRange,
}

/// Scatters one solution vector per driving component into the result.
///
/// `drive` is the set the solves loop over (inputs in forward mode, outputs in
/// adjoint mode); `others` is the complementary set read out of every
/// solution.
pub(crate) struct GradientAssembler {
    mode: DerivativeMode,
    values: JacobianValues,
    converged: bool,
}

impl GradientAssembler {
    pub fn new(
        mode: DerivativeMode,
        format: ReturnFormat,
        inputs: &[ResolvedVar<'_>],
        outputs: &[ResolvedVar<'_>],
    ) -> Self {
        let values = match format {
            ReturnFormat::Array => {
                let num_input = inputs.iter().map(|s| s.range.len()).sum();
                let num_output = outputs.iter().map(|s| s.range.len()).sum();
                JacobianValues::Array(DMatrix::zeros(num_output, num_input))
            }
            ReturnFormat::Dict => {
                let ins: Vec<&str> = inputs.iter().map(|s| s.name).collect();
                let outs: Vec<&str> = outputs.iter().map(|s| s.name).collect();
                JacobianValues::Dict(seeded_dict(&outs, &ins))
            }
        };
        Self {
            mode,
            values,
            converged: true,
        }
    }

    /// Records the solution for component `local` of driving variable
    /// `param`, which is flat driving component `j` overall.
    pub fn scatter(
        &mut self,
        param: &ResolvedVar<'_>,
        local: usize,
        j: usize,
        others: &[ResolvedVar<'_>],
        dx: &DVector<f64>,
        converged: bool,
    ) {
        self.converged &= converged;
        let mut i = 0;
        for item in others {
            let nk = item.range.len();
            let values = item.range.gather(dx.as_slice());
            let mode = self.mode;
            match &mut self.values {
                JacobianValues::Array(m) => match mode {
                    DerivativeMode::Forward => m.view_mut((i, j), (nk, 1)).copy_from(&values),
                    DerivativeMode::Adjoint => {
                        m.view_mut((j, i), (1, nk)).copy_from(&values.transpose())
                    }
                },
                JacobianValues::Dict(d) => {
                    fill_dict(d, mode, param.name, param.range.len(), local, item.name, &values)
                }
            }
            i += nk;
        }
    }

    /// Writes `values` as component `local` of driving variable `param`
    /// into the nested block it shares with `item`. No-op for array results.
    pub fn fill_block(
        &mut self,
        param: &str,
        param_len: usize,
        local: usize,
        item: &str,
        values: &DVector<f64>,
    ) {
        if let JacobianValues::Dict(d) = &mut self.values {
            fill_dict(d, self.mode, param, param_len, local, item, values);
        }
    }

    /// Drops the nested pair of driving variable `param` and `item`.
    pub fn omit(&mut self, param: &str, item: &str) {
        let JacobianValues::Dict(d) = &mut self.values else {
            return;
        };
        let (output, input) = match self.mode {
            DerivativeMode::Forward => (item, param),
            DerivativeMode::Adjoint => (param, item),
        };
        if let Some(row) = d.get_mut(output) {
            row.remove(input);
        }
    }

    pub fn record_convergence(&mut self, converged: bool) {
        self.converged &= converged;
    }

    pub fn finish(self) -> JacobianResult {
        JacobianResult {
            values: self.values,
            converged: self.converged,
        }
    }
}

fn fill_dict(
    dict: &mut NestedJacobian,
    mode: DerivativeMode,
    param: &str,
    param_len: usize,
    local: usize,
    item: &str,
    values: &DVector<f64>,
) {
    let nk = values.len();
    match mode {
        DerivativeMode::Forward => {
            dict_block(dict, item, param, nk, param_len).set_column(local, values);
        }
        DerivativeMode::Adjoint => {
            dict_block(dict, param, item, param_len, nk).set_row(local, &values.transpose());
        }
    }
}

fn dict_block<'d>(
    dict: &'d mut NestedJacobian,
    output: &str,
    input: &str,
    rows: usize,
    cols: usize,
) -> &'d mut DMatrix<f64> {
    dict.entry(output.to_string())
        .or_default()
        .entry(input.to_string())
        .or_insert(None)
        .get_or_insert_with(|| DMatrix::zeros(rows, cols))
}

//! Derivative directions and variable index ranges.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LinearSolverError, Result};

/// One requested input or output of a gradient computation.
///
/// A direction names a variable and optionally an index tuple into it. Only
/// whole-variable references are supported; a tuple holding just the name is
/// the same as no tuple at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Direction {
    pub name: String,
    #[serde(default)]
    pub indices: Option<Vec<usize>>,
}

impl Direction {
    pub fn variable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indices: None,
        }
    }

    pub fn sliced(name: impl Into<String>, indices: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            indices: Some(indices),
        }
    }

    pub fn is_slice(&self) -> bool {
        self.indices.as_ref().is_some_and(|idx| !idx.is_empty())
    }

    /// Variable name of a whole-variable direction.
    pub fn whole_variable(&self) -> Result<&str> {
        if self.is_slice() {
            return Err(LinearSolverError::UnsupportedSlice {
                request: self.to_string(),
            });
        }
        Ok(&self.name)
    }
}

impl From<&str> for Direction {
    fn from(name: &str) -> Self {
        Direction::variable(name)
    }
}

impl From<String> for Direction {
    fn from(name: String) -> Self {
        Direction::variable(name)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.indices {
            Some(idx) if !idx.is_empty() => {
                let parts: Vec<String> = idx.iter().map(|i| i.to_string()).collect();
                write!(f, "{}[{}]", self.name, parts.join(", "))
            }
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Builds a direction set from plain variable names.
pub fn directions<I, T>(names: I) -> Vec<Direction>
where
    I: IntoIterator<Item = T>,
    T: Into<Direction>,
{
    names.into_iter().map(Into::into).collect()
}

/// Strips a direction set down to variable names, rejecting slices.
///
/// Every direction is checked before any name is returned, so a slice anywhere
/// in the set aborts the request before numerical work starts.
pub fn whole_variables(set: &[Direction]) -> Result<Vec<&str>> {
    set.iter().map(Direction::whole_variable).collect()
}

/// Offsets of one variable inside a flat local state vector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexRange {
    offsets: Vec<usize>,
}

impl IndexRange {
    pub fn new(offsets: Vec<usize>) -> Self {
        Self { offsets }
    }

    pub fn contiguous(start: usize, len: usize) -> Self {
        Self {
            offsets: (start..start + len).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.offsets.iter().copied()
    }

    /// Copies the entries of `vector` selected by this range.
    pub fn gather(&self, vector: &[f64]) -> DVector<f64> {
        DVector::from_iterator(self.len(), self.offsets.iter().map(|&i| vector[i]))
    }
}

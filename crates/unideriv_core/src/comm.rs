//! Collective communication between the ranks of a distributed system.
//!
//! Every collective here is **blocking** and **order-sensitive**: each rank of
//! the group must issue the same sequence of collectives with matching
//! argument shapes. A rank that skips a call, or calls in a different order,
//! stalls the whole group; there is no cancellation below the process
//! boundary. Shape disagreements that the transport can observe are reported
//! as [`LinearSolverError::CollectiveMismatch`] on every rank.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{LinearSolverError, Result};

/// A group of ranks that can combine values collectively.
pub trait Communicator: Send + Sync {
    /// Rank of the calling process within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Element-wise sum of `values` over all ranks, written back in place.
    ///
    /// Blocking collective. Every rank must pass a slice of the same length.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Sum of one scalar over all ranks.
    fn all_reduce_scalar(&self, value: f64) -> Result<f64> {
        let mut buf = [value];
        self.all_reduce_sum(&mut buf)?;
        Ok(buf[0])
    }

    /// Inner product of two rank-local pieces of distributed vectors.
    fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64> {
        if a.len() != b.len() {
            return Err(LinearSolverError::DimensionMismatch {
                message: format!("dot of lengths {} and {}", a.len(), b.len()),
            });
        }
        let local: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        self.all_reduce_scalar(local)
    }

    /// Euclidean norm of a distributed vector: local sum of squares, then a
    /// global combine.
    fn norm(&self, a: &[f64]) -> Result<f64> {
        let local: f64 = a.iter().map(|v| v * v).sum();
        Ok(self.all_reduce_scalar(local)?.sqrt())
    }
}

/// The one-rank group. Collectives are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

pub(crate) static SERIAL: SerialCommunicator = SerialCommunicator;

struct ThreadGroup {
    size: usize,
    slots: Mutex<Vec<Vec<f64>>>,
    barrier: Barrier,
}

/// One rank of an in-process group, each rank driven by its own thread.
///
/// Contributions are summed in rank order, so every rank receives bit-identical
/// results. That keeps replicated Krylov state (Hessenberg matrix, Givens
/// rotations) consistent across ranks.
#[derive(Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    group: Arc<ThreadGroup>,
}

impl ThreadCommunicator {
    /// Creates the communicators of a group of `size` ranks, ordered by rank.
    pub fn group(size: usize) -> Vec<ThreadCommunicator> {
        let group = Arc::new(ThreadGroup {
            size,
            slots: Mutex::new(vec![Vec::new(); size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| ThreadCommunicator {
                rank,
                group: Arc::clone(&group),
            })
            .collect()
    }

    fn poisoned(&self) -> LinearSolverError {
        LinearSolverError::CollectiveMismatch {
            rank: self.rank,
            message: "a peer rank panicked during a collective".to_string(),
        }
    }
}

impl std::fmt::Debug for ThreadCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.group.size)
            .finish()
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        {
            let mut slots = self.group.slots.lock().map_err(|_| self.poisoned())?;
            slots[self.rank].clear();
            slots[self.rank].extend_from_slice(values);
        }
        self.group.barrier.wait();

        let outcome = {
            let slots = self.group.slots.lock().map_err(|_| self.poisoned())?;
            match slots.iter().position(|s| s.len() != values.len()) {
                Some(peer) => Err(LinearSolverError::CollectiveMismatch {
                    rank: self.rank,
                    message: format!(
                        "all_reduce_sum length {} on this rank, {} on rank {}",
                        values.len(),
                        slots[peer].len(),
                        peer
                    ),
                }),
                None => {
                    for (i, v) in values.iter_mut().enumerate() {
                        *v = slots.iter().map(|s| s[i]).sum();
                    }
                    Ok(())
                }
            }
        };

        // No rank may overwrite its slot for the next round until all have read.
        self.group.barrier.wait();
        outcome
    }
}

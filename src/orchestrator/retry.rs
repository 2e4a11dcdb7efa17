//! Partial re-runs built from a finished run.
//!
//! Retried jobs keep the index they had in the first queue, so their results
//! and file names land exactly where the failed attempt's did.

use std::collections::BTreeSet;

use crate::state_machine::{Job, JobResult};

/// The queue and result seed for a retry sub-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub queue: Vec<Job>,
    /// Results of the previous run that are not being retried.
    pub kept: Vec<JobResult>,
}

impl RetryPlan {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct RetrySelector<'a> {
    original_queue: &'a [Job],
    results: &'a [JobResult],
}

impl<'a> RetrySelector<'a> {
    pub fn new(original_queue: &'a [Job], results: &'a [JobResult]) -> Self {
        Self {
            original_queue,
            results,
        }
    }

    /// Every index whose last result is a failure.
    pub fn failed(&self) -> RetryPlan {
        self.build(
            self.results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.index)
                .collect(),
        )
    }

    /// Caller-chosen indices. Duplicates collapse; unknown indices are dropped.
    pub fn selected(&self, indices: &[usize]) -> RetryPlan {
        self.build(indices.iter().copied().collect())
    }

    fn build(&self, targets: BTreeSet<usize>) -> RetryPlan {
        let targets: BTreeSet<usize> = targets
            .into_iter()
            .filter(|&index| {
                let known = index < self.original_queue.len();
                if !known {
                    tracing::warn!(index, "Ignoring retry of unknown index");
                }
                known
            })
            .collect();

        let queue = targets
            .iter()
            .enumerate()
            .map(|(position, &index)| {
                let mut job = self.original_queue[index].clone();
                job.sequence_index = position;
                job.original_index = index;
                job.reset_rewrites();
                job
            })
            .collect();

        let kept = self
            .results
            .iter()
            .filter(|r| !targets.contains(&r.index))
            .cloned()
            .collect();

        RetryPlan { queue, kept }
    }
}

//! Shared priority queue of pending tile jobs

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};

use super::request::{RenderJob, RequestId};

/// Ordering of queued jobs, highest first.
///
/// Settled-scale work beats transit work, newer passes beat older ones,
/// tiles near the viewport center beat far ones, older requests win ties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Priority {
    pub settled: bool,
    pub epoch: u64,
    /// Squared distance to the viewport center, in pixels
    pub distance: u64,
    pub id: RequestId,
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.settled
            .cmp(&other.settled)
            .then(self.epoch.cmp(&other.epoch))
            .then(other.distance.cmp(&self.distance))
            .then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Queued {
    priority: Priority,
    job: RenderJob,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Jobs waiting for a worker
#[derive(Debug, Default)]
pub struct RenderQueue {
    heap: Mutex<BinaryHeap<Queued>>,
}

impl RenderQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: RenderJob, priority: Priority) {
        self.lock().push(Queued { priority, job });
    }

    /// Take the highest priority job
    pub fn pop(&self) -> Option<RenderJob> {
        self.lock().pop().map(|q| q.job)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Rescore every queued job; jobs scored `None` are removed and returned
    pub fn rescore<F>(&self, mut score: F) -> Vec<RenderJob>
    where
        F: FnMut(&RenderJob) -> Option<Priority>,
    {
        let mut heap = self.lock();
        let mut dropped = Vec::new();
        let kept: Vec<Queued> = std::mem::take(&mut *heap)
            .into_vec()
            .into_iter()
            .filter_map(|q| match score(&q.job) {
                Some(priority) => Some(Queued {
                    priority,
                    job: q.job,
                }),
                None => {
                    dropped.push(q.job);
                    None
                }
            })
            .collect();
        *heap = BinaryHeap::from(kept);
        dropped
    }

    /// Shrink to `max` jobs, returning the lowest priority ones removed
    pub fn truncate(&self, max: usize) -> Vec<RenderJob> {
        let mut heap = self.lock();
        if heap.len() <= max {
            return Vec::new();
        }
        // ascending order: the lowest priorities come first
        let mut sorted = std::mem::take(&mut *heap).into_sorted_vec();
        let kept = sorted.split_off(sorted.len() - max);
        *heap = BinaryHeap::from(kept);
        sorted.into_iter().map(|q| q.job).collect()
    }

    /// Drop every job matching `pred`
    pub fn remove_where<F>(&self, mut pred: F) -> Vec<RenderJob>
    where
        F: FnMut(&RenderJob) -> bool,
    {
        let mut heap = self.lock();
        let (removed, kept): (Vec<Queued>, Vec<Queued>) =
            std::mem::take(&mut *heap).into_vec().into_iter().partition(|q| pred(&q.job));
        *heap = BinaryHeap::from(kept);
        removed.into_iter().map(|q| q.job).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Queued>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! The evaluation queue.
//!
//! Nodes are popped in `(step ascending, priority descending)` order, which
//! is a topological order whenever the compiled step numbering is right. The
//! deferred set holds nodes that found an input still pending; they return
//! to the queue when that input completes.

use crate::arena::NodeId;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub step: u32,
    pub priority: Reverse<i32>,
    pub node: NodeId,
}

impl QueueKey {
    pub fn new(step: u32, priority: i32, node: NodeId) -> Self {
        Self {
            step,
            priority: Reverse(priority),
            node,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub evaluations: u64,
    pub deferrals: u64,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeSet<QueueKey>,
    deferred: BTreeSet<NodeId>,
    /// Indeterminate nodes, requeued at the start of the next cycle
    retry: Vec<NodeId>,
    stats: CycleStats,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: QueueKey) -> bool {
        self.queue.insert(key)
    }

    pub fn unschedule(&mut self, key: QueueKey) -> bool {
        self.queue.remove(&key)
    }

    pub fn pop(&mut self) -> Option<QueueKey> {
        let key = self.queue.pop_first()?;
        self.stats.evaluations += 1;
        Some(key)
    }

    pub fn peek(&self) -> Option<&QueueKey> {
        self.queue.first()
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueueKey> {
        self.queue.iter()
    }

    pub fn defer(&mut self, node: NodeId) {
        self.deferred.insert(node);
        self.stats.deferrals += 1;
    }

    pub fn undefer(&mut self, node: NodeId) -> bool {
        self.deferred.remove(&node)
    }

    pub fn deferred(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.deferred.iter().copied()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn retry_next_cycle(&mut self, node: NodeId) {
        if !self.retry.contains(&node) {
            self.retry.push(node);
        }
    }

    pub fn take_retries(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.retry)
    }

    pub fn forget_retry(&mut self, node: NodeId) {
        self.retry.retain(|n| *n != node);
    }

    pub fn has_retries(&self) -> bool {
        !self.retry.is_empty()
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.deferred.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Start a new change cycle and reset the per-cycle counters.
    pub fn next_cycle(&mut self) -> u64 {
        self.stats = CycleStats {
            cycle: self.stats.cycle + 1,
            ..CycleStats::default()
        };
        self.stats.cycle
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }
}

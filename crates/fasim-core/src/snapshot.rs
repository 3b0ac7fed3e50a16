//! Published simulation state and the bounded snapshot history.
//!
//! A [`SimulationSnapshot`] is an owned, immutable copy of one step: no
//! references into the driver's storage. Snapshots are shared as
//! `Arc<SimulationSnapshot>`, so any number of readers on any thread can
//! hold them while the driver keeps stepping.

use crate::analyzer::{Finding, Summary, summarize};
use crate::id::{EdgeId, ItemKind, NodeId};
use crate::rate::{Fixed64, Rate};
use crate::sim::SimClock;
use crate::solver::{BufferLevels, FlowSolution, NodeFlow};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Items that did not fit in a full buffer during one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spill {
    pub node: NodeId,
    pub item: ItemKind,
    pub amount: Fixed64,
}

/// State of the simulation after one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub step: u64,
    /// Simulated seconds since start.
    pub time: Fixed64,
    /// Graph revision this snapshot was solved against.
    pub graph_revision: u64,
    /// Buffer stock at the start of the step, after the previous flows
    /// were applied.
    pub buffers: BufferLevels,
    pub spilled: Vec<Spill>,
    pub solution: FlowSolution,
    pub findings: Vec<Finding>,
    pub state_hash: u64,
}

impl SimulationSnapshot {
    pub fn clock(&self) -> SimClock {
        SimClock {
            step: self.step,
            time: self.time,
        }
    }

    pub fn edge_rate(&self, edge: EdgeId) -> Rate {
        self.solution.edge_rate(edge)
    }

    pub fn level(&self, node: NodeId) -> Option<Fixed64> {
        self.solution.level(node)
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeFlow> {
        self.solution.node(node)
    }

    pub fn buffer(&self, node: NodeId, item: ItemKind) -> Fixed64 {
        self.buffers.get(node, item)
    }

    pub fn summary(&self) -> Summary {
        summarize(&self.findings)
    }
}

// ---------------------------------------------------------------------------
// SnapshotHistory
// ---------------------------------------------------------------------------

/// Fixed-capacity ring of published snapshots.
///
/// When full, the oldest entry is overwritten. Iterates oldest-to-newest.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    data: Vec<Option<Arc<SimulationSnapshot>>>,
    head: usize,
    len: usize,
}

impl SnapshotHistory {
    /// Create a history holding at most `capacity` snapshots (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![None; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    /// Push a snapshot, overwriting the oldest entry if at capacity.
    pub fn push(&mut self, snapshot: Arc<SimulationSnapshot>) {
        let capacity = self.capacity();
        self.data[self.head] = Some(snapshot);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The most recently pushed snapshot, if any.
    pub fn latest(&self) -> Option<&Arc<SimulationSnapshot>> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity() - 1) % self.capacity();
        self.data[idx].as_ref()
    }

    /// Retained snapshots, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SimulationSnapshot>> + '_ {
        let start = (self.head + self.capacity() - self.len) % self.capacity();
        (0..self.len).filter_map(move |i| self.data[(start + i) % self.capacity()].as_ref())
    }

    /// The retained snapshot for `step`.
    pub fn get(&self, step: u64) -> Option<&Arc<SimulationSnapshot>> {
        self.iter().find(|s| s.step == step)
    }

    /// Oldest retained step.
    pub fn oldest_step(&self) -> Option<u64> {
        self.iter().next().map(|s| s.step)
    }

    /// Drop every snapshot newer than `step`.
    pub fn truncate_after(&mut self, step: u64) {
        let kept: Vec<Arc<SimulationSnapshot>> =
            self.iter().filter(|s| s.step <= step).cloned().collect();
        self.clear();
        for snapshot in kept {
            self.push(snapshot);
        }
    }

    /// Remove all snapshots without changing capacity.
    pub fn clear(&mut self) {
        for slot in &mut self.data {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(step: u64) -> Arc<SimulationSnapshot> {
        Arc::new(SimulationSnapshot {
            step,
            time: Fixed64::from_num(step),
            graph_revision: 0,
            buffers: BufferLevels::new(),
            spilled: Vec::new(),
            solution: FlowSolution {
                edges: BTreeMap::new(),
                nodes: BTreeMap::new(),
                iterations: 0,
                components: 0,
                tolerance: Fixed64::ZERO,
            },
            findings: Vec::new(),
            state_hash: step,
        })
    }

    fn steps(history: &SnapshotHistory) -> Vec<u64> {
        history.iter().map(|s| s.step).collect()
    }

    #[test]
    fn history_basic() {
        let mut history = SnapshotHistory::new(3);
        assert!(history.is_empty());
        assert!(history.latest().is_none());
        history.push(snapshot(0));
        history.push(snapshot(1));
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(|s| s.step), Some(1));
        assert_eq!(steps(&history), vec![0, 1]);
    }

    #[test]
    fn history_overwrites_oldest() {
        let mut history = SnapshotHistory::new(3);
        for step in 0..5 {
            history.push(snapshot(step));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(steps(&history), vec![2, 3, 4]);
        assert_eq!(history.oldest_step(), Some(2));
        assert!(history.get(1).is_none());
        assert_eq!(history.get(3).map(|s| s.state_hash), Some(3));
    }

    #[test]
    fn truncate_drops_newer_snapshots() {
        let mut history = SnapshotHistory::new(4);
        for step in 0..6 {
            history.push(snapshot(step));
        }
        history.truncate_after(3);
        assert_eq!(steps(&history), vec![2, 3]);
        assert_eq!(history.latest().map(|s| s.step), Some(3));
        history.push(snapshot(4));
        assert_eq!(steps(&history), vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_keeps_one() {
        let mut history = SnapshotHistory::new(0);
        history.push(snapshot(0));
        history.push(snapshot(1));
        assert_eq!(history.capacity(), 1);
        assert_eq!(steps(&history), vec![1]);
    }

    #[test]
    fn snapshots_are_shareable_across_threads() {
        let shared = snapshot(7);
        let reader = Arc::clone(&shared);
        let handle = std::thread::spawn(move || reader.step);
        assert_eq!(handle.join().unwrap(), 7);
    }
}

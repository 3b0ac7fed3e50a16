//! Simulation clock and deterministic state hashing.
//!
//! The driver advances a [`SimClock`] by one fixed step at a time. Every
//! published snapshot carries a [`StateHash`] over its buffers and flows, so
//! two runs of the same model can be compared step by step.

use crate::id::{EdgeId, ItemKind, NodeId};
use crate::rate::Fixed64;
use crate::solver::{BufferLevels, FlowSolution};
use serde::{Deserialize, Serialize};
use slotmap::Key;

// ---------------------------------------------------------------------------
// Simulation clock
// ---------------------------------------------------------------------------

/// Step counter and simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimClock {
    /// Steps published since start. Step 0 is the initial solve.
    pub step: u64,
    /// Simulated seconds since start.
    pub time: Fixed64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The clock after one more step of `step_duration` seconds.
    pub fn advanced(self, step_duration: Fixed64) -> Self {
        Self {
            step: self.step + 1,
            time: self.time.saturating_add(step_duration),
        }
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of simulation state for desync detection.
///
/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn write_node(&mut self, id: NodeId) {
        self.write_u64(id.data().as_ffi());
    }

    pub fn write_edge(&mut self, id: EdgeId) {
        self.write_u64(id.data().as_ffi());
    }

    pub fn write_item(&mut self, item: ItemKind) {
        self.write_u32(item.0);
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash of everything a step publishes: clock, buffer stock, node levels
/// and edge rates, all in id order.
pub fn hash_state(clock: SimClock, buffers: &BufferLevels, solution: &FlowSolution) -> u64 {
    let mut h = StateHash::new();
    h.write_u64(clock.step);
    h.write_fixed64(clock.time);
    for (node, item, amount) in buffers.iter() {
        h.write_node(node);
        h.write_item(item);
        h.write_fixed64(amount);
    }
    for (&node, flow) in &solution.nodes {
        h.write_node(node);
        h.write_fixed64(flow.level);
    }
    for (&edge, flow) in &solution.edges {
        h.write_edge(edge);
        h.write_fixed64(flow.rate);
    }
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::solve_steady;
    use crate::test_utils::*;

    #[test]
    fn clock_starts_at_zero_and_advances() {
        let clock = SimClock::new();
        assert_eq!(clock.step, 0);
        assert_eq!(clock.time, Fixed64::ZERO);
        let next = clock.advanced(fixed(0.5)).advanced(fixed(0.5));
        assert_eq!(next.step, 2);
        assert_eq!(next.time, fixed(1.0));
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        h1.write_u32(7);

        let mut h2 = StateHash::new();
        h2.write_u64(42);
        h2.write_u32(7);

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_order_matters() {
        let mut h1 = StateHash::new();
        h1.write_u32(1);
        h1.write_u32(2);

        let mut h2 = StateHash::new();
        h2.write_u32(2);
        h2.write_u32(1);

        assert_ne!(h1.finish(), h2.finish());
    }

    #[test]
    fn hash_tracks_solution_and_buffers() {
        let (graph, line) = smelter_line(Some(1.5), 2.0);
        let solution = solve_steady(&graph).unwrap();
        let empty = BufferLevels::new();
        let clock = SimClock::new();

        let a = hash_state(clock, &empty, &solution);
        assert_eq!(a, hash_state(clock, &empty, &solution));

        let mut stocked = BufferLevels::new();
        stocked.set(line.sink, item("iron_plate"), fixed(1.0));
        assert_ne!(a, hash_state(clock, &stocked, &solution));
        assert_ne!(a, hash_state(clock.advanced(fixed(1.0)), &empty, &solution));

        let (other, _) = smelter_line(Some(1.0), 2.0);
        let other_solution = solve_steady(&other).unwrap();
        assert_ne!(a, hash_state(clock, &empty, &other_solution));
    }
}

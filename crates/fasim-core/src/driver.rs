//! Incremental simulation driver.
//!
//! Wraps the flow solver and analyzer in a fixed-step time loop:
//!
//! ```text
//! Idle --start--> Running --pause--> Paused --resume--> Running
//!   \               |                  |
//!    `------------stop--------------stop-----> Stopped (terminal)
//! ```
//!
//! Each step runs three phases, in order:
//!
//! 1. **Apply** -- the previous snapshot's rates move items into buffers
//!    for one step duration. Buffers are clamped to their capacity and the
//!    excess is recorded as spill.
//! 2. **Solve** -- the flow solver runs against the new buffer state, so
//!    full buffers push back on their producers.
//! 3. **Publish** -- findings and a state hash are computed, and the new
//!    snapshot is pushed into the history and to every listener.
//!
//! A step that fails to solve changes nothing. Structural graph edits are
//! only accepted while `Idle` or `Paused`.

use crate::analyzer::{Finding, analyze};
use crate::graph::{GraphError, NodeKind, ProductionGraph, SlotDirection};
use crate::id::*;
use crate::rate::*;
use crate::sim::{SimClock, hash_state};
use crate::snapshot::{SimulationSnapshot, SnapshotHistory, Spill};
use crate::solver::{BackpressurePolicy, BufferLevels, FlowSolution, SolveContext, SolveError, SolverConfig, solve};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Simulated seconds per step.
    pub step_duration: f64,
    /// Snapshots retained for inspection and rollback.
    pub history_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub solver: SolverConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            step_duration: 1.0,
            history_capacity: 64,
            backpressure: BackpressurePolicy::Block,
            solver: SolverConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("graph edits are not allowed while the driver is running")]
    GraphLockedWhileRunning,
    #[error("cannot {action} while {from:?}")]
    InvalidTransition {
        from: DriverState,
        action: &'static str,
    },
    #[error("driver is stopped")]
    Stopped,
    #[error("driver is not running")]
    NotRunning,
    #[error("no snapshot retained for step {0}")]
    SnapshotNotFound(u64),
    #[error("snapshot for step {step} was solved against graph revision {snapshot_revision}, graph is at {graph_revision}")]
    StaleSnapshot {
        step: u64,
        snapshot_revision: u64,
        graph_revision: u64,
    },
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Solve(#[from] SolveError),
}

/// Callback for newly published snapshots.
pub type SnapshotListener = Box<dyn FnMut(&Arc<SimulationSnapshot>) + Send>;

/// Thread-safe cancellation flag for [`SimulationDriver::run`]. Checked at
/// step boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Owns the graph, buffer state and snapshot history. Single writer: only
/// the thread holding the driver mutates them; snapshots are shared.
pub struct SimulationDriver {
    graph: ProductionGraph,
    config: DriverConfig,
    step_duration: Fixed64,
    state: DriverState,
    clock: SimClock,
    buffers: BufferLevels,
    history: SnapshotHistory,
    latest: Option<Arc<SimulationSnapshot>>,
    listeners: Vec<SnapshotListener>,
    cancel: CancelHandle,
}

impl std::fmt::Debug for SimulationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationDriver")
            .field("state", &self.state)
            .field("clock", &self.clock)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .field("history", &self.history.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl SimulationDriver {
    pub fn new(graph: ProductionGraph, config: DriverConfig) -> Result<Self, DriverError> {
        if !config.step_duration.is_finite() || config.step_duration <= 0.0 {
            return Err(DriverError::InvalidConfig("step_duration must be positive"));
        }
        let step_duration = try_f64_to_fixed64(config.step_duration)
            .filter(|d| *d > Fixed64::ZERO)
            .ok_or(DriverError::InvalidConfig("step_duration is out of range"))?;
        if !config.solver.tolerance.is_finite() || config.solver.tolerance < 0.0 {
            return Err(DriverError::InvalidConfig("tolerance must be non-negative"));
        }
        Ok(Self::build(graph, config, step_duration))
    }

    /// Driver with [`DriverConfig::default`]: one-second steps.
    pub fn with_defaults(graph: ProductionGraph) -> Self {
        Self::build(graph, DriverConfig::default(), Fixed64::ONE)
    }

    fn build(graph: ProductionGraph, config: DriverConfig, step_duration: Fixed64) -> Self {
        Self {
            graph,
            history: SnapshotHistory::new(config.history_capacity),
            config,
            step_duration,
            state: DriverState::Idle,
            clock: SimClock::new(),
            buffers: BufferLevels::new(),
            latest: None,
            listeners: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn graph(&self) -> &ProductionGraph {
        &self.graph
    }

    pub fn clock(&self) -> SimClock {
        self.clock
    }

    pub fn buffers(&self) -> &BufferLevels {
        &self.buffers
    }

    // -----------------------------------------------------------------------
    // Graph editing
    // -----------------------------------------------------------------------

    fn check_editable(&self) -> Result<(), DriverError> {
        match self.state {
            DriverState::Idle | DriverState::Paused => Ok(()),
            DriverState::Running => Err(DriverError::GraphLockedWhileRunning),
            DriverState::Stopped => Err(DriverError::Stopped),
        }
    }

    /// Mutable graph access. Edits take effect at the next step.
    pub fn graph_mut(&mut self) -> Result<&mut ProductionGraph, DriverError> {
        self.check_editable()?;
        Ok(&mut self.graph)
    }

    pub fn add_node(&mut self, recipe: RecipeId, multiplier: Fixed64) -> Result<NodeId, DriverError> {
        Ok(self.graph_mut()?.add_node(recipe, multiplier)?)
    }

    pub fn add_source(&mut self, item: ItemKind, rate: Option<Rate>) -> Result<NodeId, DriverError> {
        Ok(self.graph_mut()?.add_source(item, rate)?)
    }

    pub fn add_sink(&mut self, item: ItemKind, rate: Option<Rate>) -> Result<NodeId, DriverError> {
        Ok(self.graph_mut()?.add_sink(item, rate)?)
    }

    pub fn add_merge(&mut self, item: ItemKind, inputs: u32) -> Result<NodeId, DriverError> {
        Ok(self.graph_mut()?.add_merge(item, inputs)?)
    }

    pub fn add_split(&mut self, item: ItemKind, outputs: u32) -> Result<NodeId, DriverError> {
        Ok(self.graph_mut()?.add_split(item, outputs)?)
    }

    pub fn connect(
        &mut self,
        from: NodeId,
        output_item: ItemKind,
        to: NodeId,
        input_item: ItemKind,
        capacity: Option<Rate>,
    ) -> Result<EdgeId, DriverError> {
        Ok(self
            .graph_mut()?
            .connect(from, output_item, to, input_item, capacity)?)
    }

    pub fn disconnect(&mut self, edge: EdgeId) -> Result<(), DriverError> {
        self.graph_mut()?.disconnect(edge)?;
        Ok(())
    }

    pub fn remove_node(&mut self, node: NodeId) -> Result<(), DriverError> {
        self.graph_mut()?.remove_node(node)?;
        self.buffers.remove_node(node);
        Ok(())
    }

    pub fn set_buffer_capacity(
        &mut self,
        node: NodeId,
        item: ItemKind,
        capacity: Fixed64,
    ) -> Result<(), DriverError> {
        self.graph_mut()?.set_buffer_capacity(node, item, capacity)?;
        Ok(())
    }

    /// Put stock into a declared buffer, clamped to its capacity.
    pub fn set_stock(&mut self, node: NodeId, item: ItemKind, amount: Fixed64) -> Result<(), DriverError> {
        self.check_editable()?;
        let data = self.graph.node(node).ok_or(GraphError::NodeNotFound(node))?;
        let capacity = data
            .buffers
            .get(&item)
            .copied()
            .ok_or(GraphError::TypeMismatch {
                node,
                item,
                direction: SlotDirection::Input,
            })?;
        self.buffers
            .set(node, item, amount.clamp(Fixed64::ZERO, capacity));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn transition(&mut self, to: DriverState) {
        tracing::info!(from = ?self.state, to = ?to, step = self.clock.step, "driver state change");
        self.state = to;
    }

    /// Idle -> Running. Solves and publishes step 0.
    pub fn start(&mut self) -> Result<Arc<SimulationSnapshot>, DriverError> {
        if self.state != DriverState::Idle {
            return Err(DriverError::InvalidTransition {
                from: self.state,
                action: "start",
            });
        }
        let solution = self.solve_with(&self.buffers)?;
        self.transition(DriverState::Running);
        let buffers = self.buffers.clone();
        Ok(self.publish(self.clock, buffers, Vec::new(), solution))
    }

    /// Running -> Paused.
    pub fn pause(&mut self) -> Result<(), DriverError> {
        if self.state != DriverState::Running {
            return Err(DriverError::InvalidTransition {
                from: self.state,
                action: "pause",
            });
        }
        self.transition(DriverState::Paused);
        Ok(())
    }

    /// Paused -> Running.
    pub fn resume(&mut self) -> Result<(), DriverError> {
        if self.state != DriverState::Paused {
            return Err(DriverError::InvalidTransition {
                from: self.state,
                action: "resume",
            });
        }
        self.transition(DriverState::Running);
        Ok(())
    }

    /// Any state except Stopped -> Stopped. Terminal.
    pub fn stop(&mut self) -> Result<(), DriverError> {
        if self.state == DriverState::Stopped {
            return Err(DriverError::InvalidTransition {
                from: self.state,
                action: "stop",
            });
        }
        self.transition(DriverState::Stopped);
        Ok(())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Advance one step. Fails without side effects if the solve fails.
    pub fn step(&mut self) -> Result<Arc<SimulationSnapshot>, DriverError> {
        match self.state {
            DriverState::Running => {}
            DriverState::Stopped => return Err(DriverError::Stopped),
            DriverState::Idle | DriverState::Paused => return Err(DriverError::NotRunning),
        }
        let previous = self.latest.clone().ok_or(DriverError::NotRunning)?;

        // Phase 1: apply the previous rates to the buffers.
        let (buffers, spilled) = apply_flows(&self.graph, &previous.solution, &self.buffers, self.step_duration);
        for spill in &spilled {
            tracing::warn!(
                node = ?spill.node,
                item = spill.item.0,
                amount = %spill.amount,
                "buffer overflow; items spilled"
            );
        }

        // Phase 2: solve against the new buffer state.
        let solution = self.solve_with(&buffers)?;

        // Phase 3: publish.
        let clock = self.clock.advanced(self.step_duration);
        Ok(self.publish(clock, buffers, spilled, solution))
    }

    /// Step until `max_steps` steps ran, the driver leaves `Running`, or a
    /// cancellation request is seen. A cancelled run leaves the driver
    /// `Paused`. Returns the number of steps taken.
    pub fn run(&mut self, max_steps: u64) -> Result<u64, DriverError> {
        let mut taken = 0;
        while taken < max_steps {
            if self.cancel.take() {
                self.pause()?;
                break;
            }
            if self.state != DriverState::Running {
                break;
            }
            self.step()?;
            taken += 1;
        }
        Ok(taken)
    }

    fn solve_with(&self, buffers: &BufferLevels) -> Result<FlowSolution, SolveError> {
        let ctx = SolveContext::new(&self.config.solver).with_buffers(
            buffers,
            self.step_duration,
            self.config.backpressure,
        );
        solve(&self.graph, &ctx)
    }

    fn publish(
        &mut self,
        clock: SimClock,
        buffers: BufferLevels,
        spilled: Vec<Spill>,
        solution: FlowSolution,
    ) -> Arc<SimulationSnapshot> {
        let findings = analyze(&solution, &self.graph);
        let state_hash = hash_state(clock, &buffers, &solution);
        let snapshot = Arc::new(SimulationSnapshot {
            step: clock.step,
            time: clock.time,
            graph_revision: self.graph.revision(),
            buffers: buffers.clone(),
            spilled,
            solution,
            findings,
            state_hash,
        });

        self.clock = clock;
        self.buffers = buffers;
        self.history.push(Arc::clone(&snapshot));
        self.latest = Some(Arc::clone(&snapshot));
        for listener in &mut self.listeners {
            listener(&snapshot);
        }
        tracing::trace!(step = clock.step, hash = state_hash, "published snapshot");
        snapshot
    }

    // -----------------------------------------------------------------------
    // Snapshot access
    // -----------------------------------------------------------------------

    pub fn latest_snapshot(&self) -> Option<Arc<SimulationSnapshot>> {
        self.latest.clone()
    }

    /// Register a listener called with every snapshot published from now on.
    pub fn on_snapshot(&mut self, listener: SnapshotListener) {
        self.listeners.push(listener);
    }

    /// Ranked findings of the latest snapshot.
    pub fn findings(&self) -> &[Finding] {
        self.latest
            .as_ref()
            .map(|s| s.findings.as_slice())
            .unwrap_or(&[])
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn snapshot_at(&self, step: u64) -> Result<Arc<SimulationSnapshot>, DriverError> {
        self.history
            .get(step)
            .cloned()
            .ok_or(DriverError::SnapshotNotFound(step))
    }

    /// Restore buffers and clock from a retained snapshot and discard newer
    /// history. Only while `Paused`, and only if the graph has not changed
    /// since that snapshot was solved.
    pub fn rollback_to(&mut self, step: u64) -> Result<Arc<SimulationSnapshot>, DriverError> {
        if self.state != DriverState::Paused {
            return Err(DriverError::InvalidTransition {
                from: self.state,
                action: "roll back",
            });
        }
        let snapshot = self.snapshot_at(step)?;
        if snapshot.graph_revision != self.graph.revision() {
            return Err(DriverError::StaleSnapshot {
                step,
                snapshot_revision: snapshot.graph_revision,
                graph_revision: self.graph.revision(),
            });
        }
        self.buffers = snapshot.buffers.clone();
        self.clock = snapshot.clock();
        self.history.truncate_after(step);
        self.latest = Some(Arc::clone(&snapshot));
        tracing::info!(step, "rolled back");
        Ok(snapshot)
    }
}

/// Move one step's worth of flow into every declared buffer.
///
/// Machine input buffers gain inflow and lose consumption; storage sinks
/// only gain. Stock is clamped to `[0, capacity]` and overflow is returned
/// as spill. Buffers of nodes missing from `solution` (added since it was
/// solved) keep their stock.
fn apply_flows(
    graph: &ProductionGraph,
    solution: &FlowSolution,
    buffers: &BufferLevels,
    dt: Fixed64,
) -> (BufferLevels, Vec<Spill>) {
    let mut next = BufferLevels::new();
    let mut spilled = Vec::new();

    for (id, data) in graph.nodes() {
        for (&item, &capacity) in &data.buffers {
            let stock = buffers.get(id, item);
            let Some(flow) = solution.node(id) else {
                next.set(id, item, stock.min(capacity));
                continue;
            };
            let (inflow, consumed) = flow
                .inputs
                .iter()
                .find(|input| input.item == item)
                .map(|input| {
                    let inflow = input.edge.map(|e| solution.edge_rate(e)).unwrap_or(Fixed64::ZERO);
                    let consumed = match data.kind {
                        NodeKind::Machine { .. } => input.required,
                        _ => Fixed64::ZERO,
                    };
                    (inflow, consumed)
                })
                .unwrap_or((Fixed64::ZERO, Fixed64::ZERO));

            let gained = add_rate(stock, mul_rate(inflow, dt));
            let level = sub_floor(gained, mul_rate(consumed, dt));
            if level > capacity {
                spilled.push(Spill {
                    node: id,
                    item,
                    amount: sub_floor(level, capacity),
                });
                next.set(id, item, capacity);
            } else {
                next.set(id, item, level);
            }
        }
    }
    (next, spilled)
}

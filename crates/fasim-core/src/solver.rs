//! Flow solver: steady-state rates for every edge and activity levels for
//! every machine.
//!
//! The solver is a pure function of a [`ProductionGraph`] and a
//! [`SolveContext`] (configuration plus optional buffer state). It runs in
//! five stages:
//!
//! 1. **Static limits.** Each edge gets `min(capacity, acceptance)`, where
//!    acceptance is what the destination slot can take when its owner runs
//!    as fast as its own outputs allow (plus buffer headroom). Limits are
//!    resolved by a backward fixed point that only ever lowers values, so a
//!    full buffer pushes back through whole chains and cycles terminate.
//! 2. **Supply potential.** Machines start at their multiplier (capped by
//!    their output limits) and edges at their limits. Each Jacobi sweep
//!    lowers edge flows to what the producer can currently offer and lowers
//!    machine levels to `min over inputs of supply / required`. Splits
//!    divide by static limits here.
//! 3. **Demand.** A backward fixed point gives each edge what its consumer
//!    could use if that edge were not the constraint: a machine input asks
//!    for `required * level`, where the level is bounded by the other
//!    inputs' supply potential and by what the outputs are asked for.
//! 4. **Relaxation.** The forward sweeps run again from the top with every
//!    edge also held to what its consumer takes at its current level, and
//!    every machine to what its outputs take. Splits divide by demand, and
//!    pass on no more than their outputs take. Every quantity is
//!    non-increasing in each pass, so cycles converge instead of recursing.
//! 5. **Rationing.** When a merge is offered more than its output can carry,
//!    the inputs share the output by [`fair_share`]. Unshipped production is
//!    reported as output surplus on the producer.
//!
//! Weakly connected components are independent and are solved separately,
//! on rayon workers when the `parallel` feature is enabled. Results are
//! identical either way.

use crate::graph::{NodeKind, ProductionGraph};
use crate::id::*;
use crate::rate::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What a full buffer does to the edge feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// A full buffer accepts nothing until it drains.
    #[default]
    Block,
    /// A full buffer keeps accepting as fast as its owner consumes.
    Throttle,
}

/// Convergence parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Largest per-sweep change (items/s or level) still counted as converged.
    pub tolerance: f64,
    /// Sweep budget before reporting [`SolveError::SolverDidNotConverge`].
    pub max_iterations: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-9,
            max_iterations: 10_000,
        }
    }
}

/// Inputs to one solve besides the graph itself.
#[derive(Debug, Clone, Copy)]
pub struct SolveContext<'a> {
    pub tolerance: Fixed64,
    pub max_iterations: u32,
    pub backpressure: BackpressurePolicy,
    /// Seconds per driver step. Buffer stock and headroom are spread over it.
    pub step_duration: Fixed64,
    /// Current buffer state. `None` solves the pure steady state.
    pub buffers: Option<&'a BufferLevels>,
}

impl SolveContext<'static> {
    /// Steady-state context: no buffers, no stored stock.
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            // Never below one ulp, or an exact fixed point could be missed.
            // NaN and out-of-range values fall back to that floor.
            tolerance: try_f64_to_fixed64(config.tolerance)
                .unwrap_or(Fixed64::DELTA)
                .max(Fixed64::DELTA),
            max_iterations: config.max_iterations,
            backpressure: BackpressurePolicy::default(),
            step_duration: Fixed64::ZERO,
            buffers: None,
        }
    }
}

impl Default for SolveContext<'static> {
    fn default() -> Self {
        Self::new(&SolverConfig::default())
    }
}

impl<'a> SolveContext<'a> {
    /// Solve against buffer state, spreading stock over `step_duration`.
    pub fn with_buffers<'b>(
        self,
        buffers: &'b BufferLevels,
        step_duration: Fixed64,
        backpressure: BackpressurePolicy,
    ) -> SolveContext<'b> {
        SolveContext {
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            backpressure,
            step_duration,
            buffers: Some(buffers),
        }
    }

    fn buffered(&self) -> Option<&'a BufferLevels> {
        if self.step_duration > Fixed64::ZERO {
            self.buffers
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer state
// ---------------------------------------------------------------------------

/// Stored stock per (node, item). Only slots with a declared buffer
/// capacity hold stock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferLevels {
    stock: BTreeMap<(NodeId, ItemKind), Fixed64>,
}

impl BufferLevels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NodeId, item: ItemKind) -> Fixed64 {
        self.stock
            .get(&(node, item))
            .copied()
            .unwrap_or(Fixed64::ZERO)
    }

    pub fn set(&mut self, node: NodeId, item: ItemKind, amount: Fixed64) {
        if amount <= Fixed64::ZERO {
            self.stock.remove(&(node, item));
        } else {
            self.stock.insert((node, item), amount);
        }
    }

    /// Drop every entry for a node.
    pub fn remove_node(&mut self, node: NodeId) {
        self.stock.retain(|(n, _), _| *n != node);
    }

    /// Total stock of one item across all nodes.
    pub fn total(&self, item: ItemKind) -> Fixed64 {
        self.stock
            .iter()
            .filter(|((_, i), _)| *i == item)
            .fold(Fixed64::ZERO, |acc, (_, &v)| add_rate(acc, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, ItemKind, Fixed64)> + '_ {
        self.stock.iter().map(|(&(n, i), &v)| (n, i, v))
    }

    pub fn is_empty(&self) -> bool {
        self.stock.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Resolved rate on one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeFlow {
    pub item: ItemKind,
    pub rate: Rate,
    /// Static limit: `min(capacity, destination acceptance)`.
    pub limit: Rate,
}

impl EdgeFlow {
    /// `rate / limit`, or zero for an unbounded or closed edge.
    pub fn utilization(&self) -> Fixed64 {
        if is_unbounded(self.limit) || self.limit <= Fixed64::ZERO {
            return Fixed64::ZERO;
        }
        div_rate(self.rate, self.limit)
    }
}

/// One input slot of a solved node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFlow {
    pub item: ItemKind,
    pub edge: Option<EdgeId>,
    /// Inflow plus stored stock spread over the step.
    pub supplied: Rate,
    /// Consumption at the solved level.
    pub required: Rate,
    pub surplus: Rate,
}

/// One output slot of a solved node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFlow {
    pub item: ItemKind,
    pub edge: Option<EdgeId>,
    pub produced: Rate,
    pub shipped: Rate,
    /// Produced but not carried away (unbound slot or merge contention).
    pub surplus: Rate,
}

/// Solved state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFlow {
    /// Activity level. For machines `0..=multiplier`; for other nodes the
    /// throughput in items per second.
    pub level: Fixed64,
    /// Theoretical maximum of `level`.
    pub max_level: Fixed64,
    pub inputs: Vec<InputFlow>,
    pub outputs: Vec<OutputFlow>,
    /// Scarcest input when a machine is held below its multiplier by supply.
    pub limiting_item: Option<ItemKind>,
    /// Set when a machine is held below its multiplier by its outputs.
    pub output_bound: bool,
}

/// Result of one solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSolution {
    pub edges: BTreeMap<EdgeId, EdgeFlow>,
    pub nodes: BTreeMap<NodeId, NodeFlow>,
    /// Sweeps used by the slowest component.
    pub iterations: u32,
    pub components: u32,
    pub tolerance: Fixed64,
}

impl FlowSolution {
    pub fn edge_rate(&self, edge: EdgeId) -> Rate {
        self.edges
            .get(&edge)
            .map(|e| e.rate)
            .unwrap_or(Fixed64::ZERO)
    }

    pub fn level(&self, node: NodeId) -> Option<Fixed64> {
        self.nodes.get(&node).map(|n| n.level)
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeFlow> {
        self.nodes.get(&node)
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&EdgeFlow> {
        self.edges.get(&edge)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolveError {
    /// The sweep budget ran out. `last_levels` holds every machine's level
    /// at that point so callers can show a provisional state.
    #[error("solver did not converge after {iterations} iterations")]
    SolverDidNotConverge {
        iterations: u32,
        last_levels: Vec<(NodeId, Fixed64)>,
    },
}

// ---------------------------------------------------------------------------
// Fair share
// ---------------------------------------------------------------------------

/// Divide `total` between consumers with the given demands.
///
/// If `total` covers every demand, each consumer gets its demand in full.
/// Otherwise the split is capacity-weighted when every demand is finite,
/// and equal water-filling (smallest demands satisfied first, ties by
/// index) when some demand is unbounded. The result never exceeds `total`
/// in sum nor any demand individually.
pub fn fair_share(total: Fixed64, demands: &[Fixed64]) -> Vec<Fixed64> {
    let sum = demands
        .iter()
        .fold(Fixed64::ZERO, |acc, &d| add_rate(acc, d));
    if total >= sum {
        return demands.to_vec();
    }
    if total <= Fixed64::ZERO {
        return vec![Fixed64::ZERO; demands.len()];
    }
    if !is_unbounded(sum) {
        // total < sum, so every share is below its demand and fits in i64.
        return demands
            .iter()
            .map(|&d| {
                let bits =
                    i128::from(total.to_bits()) * i128::from(d.to_bits()) / i128::from(sum.to_bits());
                Fixed64::from_bits(bits as i64)
            })
            .collect();
    }
    water_fill(total, demands)
}

fn water_fill(total: Fixed64, demands: &[Fixed64]) -> Vec<Fixed64> {
    let n = demands.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| (demands[i], i));
    let mut shares = vec![Fixed64::ZERO; n];
    let mut remaining = total;
    for (pos, &i) in order.iter().enumerate() {
        let left = Fixed64::from_num((n - pos) as i32);
        let give = demands[i].min(remaining / left);
        shares[i] = give;
        remaining -= give;
    }
    shares
}

// ---------------------------------------------------------------------------
// Lowered network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Role {
    Machine { multiplier: Fixed64 },
    Source { rate: Fixed64 },
    Sink { rate: Fixed64 },
    Merge,
    Split,
}

#[derive(Debug, Clone)]
struct Port {
    item: ItemKind,
    edge: Option<usize>,
    /// Items per second per unit of level (machines only).
    rate: Fixed64,
    /// Stored stock available per second this step.
    stock_rate: Fixed64,
    /// Free storage per second this step.
    headroom_rate: Fixed64,
    /// Storage is full and the policy blocks the feeding edge.
    blocked: bool,
    /// Sink acceptance. Machine acceptance depends on the output limits.
    acceptance: Fixed64,
}

#[derive(Debug, Clone)]
struct Vertex {
    id: NodeId,
    role: Role,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
}

#[derive(Debug, Clone)]
struct Link {
    id: EdgeId,
    item: ItemKind,
    from: usize,
    from_port: usize,
    to: usize,
    to_port: usize,
    capacity: Fixed64,
    limit: Fixed64,
}

/// One weakly connected component with dense indices.
struct Network {
    vertices: Vec<Vertex>,
    links: Vec<Link>,
}

impl Network {
    fn lower(graph: &ProductionGraph, ctx: &SolveContext<'_>, members: &[NodeId]) -> Self {
        let index: HashMap<NodeId, usize> = members
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let buffers = ctx.buffered();
        let dt = ctx.step_duration;

        let mut vertices = Vec::with_capacity(members.len());
        let mut edge_index: HashMap<EdgeId, usize> = HashMap::new();
        let mut links = Vec::new();

        for &id in members {
            for edge_id in graph.output_edges(id) {
                if let Some(edge) = graph.edge(edge_id)
                    && let Some(&to) = index.get(&edge.to)
                {
                    edge_index.insert(edge_id, links.len());
                    links.push(Link {
                        id: edge_id,
                        item: edge.item,
                        from: index[&id],
                        from_port: edge.from_slot as usize,
                        to,
                        to_port: edge.to_slot as usize,
                        capacity: limit_of(edge.capacity),
                        limit: limit_of(edge.capacity),
                    });
                }
            }
        }

        for &id in members {
            let Some(data) = graph.node(id) else { continue };
            let recipe = graph.recipe_of(id);
            let role = match data.kind {
                NodeKind::Machine { multiplier, .. } => Role::Machine { multiplier },
                NodeKind::Source { rate, .. } => Role::Source {
                    rate: limit_of(rate),
                },
                NodeKind::Sink { rate, .. } => Role::Sink {
                    rate: limit_of(rate),
                },
                NodeKind::Merge { .. } => Role::Merge,
                NodeKind::Split { .. } => Role::Split,
            };

            let inputs = graph
                .input_slots(id)
                .iter()
                .enumerate()
                .map(|(i, slot)| {
                    let rate = recipe
                        .and_then(|r| r.inputs.get(i).map(|entry| r.rate(entry)))
                        .unwrap_or(Fixed64::ZERO);
                    let storage = buffers.and_then(|levels| {
                        data.buffers
                            .get(&slot.item)
                            .map(|&cap| (cap, levels.get(id, slot.item)))
                    });
                    let mut port = Port {
                        item: slot.item,
                        edge: slot.edge.and_then(|e| edge_index.get(&e).copied()),
                        rate,
                        stock_rate: Fixed64::ZERO,
                        headroom_rate: Fixed64::ZERO,
                        blocked: false,
                        acceptance: match role {
                            Role::Sink { rate } => rate,
                            _ => UNBOUNDED,
                        },
                    };
                    if let Some((cap, stock)) = storage {
                        let headroom = sub_floor(cap, stock);
                        port.headroom_rate = div_rate(headroom, dt);
                        match role {
                            // Storage sinks never drain.
                            Role::Sink { .. } => {
                                port.acceptance = port.acceptance.min(port.headroom_rate);
                            }
                            Role::Machine { .. } => {
                                port.stock_rate = div_rate(stock, dt);
                                port.blocked = headroom == Fixed64::ZERO
                                    && ctx.backpressure == BackpressurePolicy::Block;
                            }
                            _ => {}
                        }
                    }
                    port
                })
                .collect();

            let outputs = graph
                .output_slots(id)
                .iter()
                .enumerate()
                .map(|(i, slot)| Port {
                    item: slot.item,
                    edge: slot.edge.and_then(|e| edge_index.get(&e).copied()),
                    rate: recipe
                        .and_then(|r| r.outputs.get(i).map(|entry| r.rate(entry)))
                        .unwrap_or(Fixed64::ZERO),
                    stock_rate: Fixed64::ZERO,
                    headroom_rate: Fixed64::ZERO,
                    blocked: false,
                    acceptance: UNBOUNDED,
                })
                .collect();

            vertices.push(Vertex {
                id,
                role,
                inputs,
                outputs,
            });
        }

        let mut network = Self { vertices, links };
        network.resolve_limits(ctx.max_iterations);
        network
    }

    /// Backward fixed point for static edge limits. Limits start at the edge
    /// capacity and only decrease, so every intermediate state is still an
    /// upper bound and an early stop is safe.
    fn resolve_limits(&mut self, max_passes: u32) {
        for _ in 0..max_passes.max(1) {
            let mut changed = false;
            for i in 0..self.links.len() {
                let link = &self.links[i];
                let dest = &self.vertices[link.to];
                let downstream = match dest.role {
                    Role::Machine { .. } => self.acceptance(dest, link.to_port),
                    Role::Sink { .. } => dest.inputs[link.to_port].acceptance,
                    Role::Merge => self.out_limit(dest, 0),
                    Role::Split => (0..dest.outputs.len())
                        .fold(Fixed64::ZERO, |acc, k| add_rate(acc, self.out_limit(dest, k))),
                    Role::Source { .. } => continue,
                };
                let limit = link.capacity.min(downstream);
                if limit < link.limit {
                    self.links[i].limit = limit;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// What a machine input takes when the machine runs as fast as its
    /// outputs allow, plus free storage.
    fn acceptance(&self, vertex: &Vertex, port: usize) -> Fixed64 {
        self.machine_take(vertex, port, self.level_cap(vertex))
    }

    /// What a machine input takes at `level`, plus free storage.
    fn machine_take(&self, vertex: &Vertex, port: usize, level: Fixed64) -> Fixed64 {
        let input = &vertex.inputs[port];
        if input.blocked {
            return Fixed64::ZERO;
        }
        add_rate(mul_rate(input.rate, level), input.headroom_rate)
    }

    /// Limit of an output slot; an unbound output discards freely.
    fn out_limit(&self, vertex: &Vertex, port: usize) -> Fixed64 {
        vertex
            .outputs
            .get(port)
            .and_then(|p| p.edge)
            .map(|e| self.links[e].limit)
            .unwrap_or(UNBOUNDED)
    }

    /// Per-link value behind an output slot; unbound outputs are unbounded.
    fn out_value(&self, vertex: &Vertex, port: usize, values: &[Fixed64]) -> Fixed64 {
        vertex
            .outputs
            .get(port)
            .and_then(|p| p.edge)
            .map(|e| values[e])
            .unwrap_or(UNBOUNDED)
    }

    /// Level ceiling from what each output link takes.
    fn output_bound(&self, vertex: &Vertex, takes: &[Fixed64]) -> Fixed64 {
        vertex
            .outputs
            .iter()
            .enumerate()
            .fold(UNBOUNDED, |bound, (k, port)| {
                bound.min(div_rate(self.out_value(vertex, k, takes), port.rate))
            })
    }

    /// Machine level ceiling from the multiplier and every output limit.
    fn level_cap(&self, vertex: &Vertex) -> Fixed64 {
        let Role::Machine { multiplier } = vertex.role else {
            return Fixed64::ZERO;
        };
        vertex
            .outputs
            .iter()
            .enumerate()
            .fold(multiplier, |cap, (k, port)| {
                cap.min(div_rate(self.out_limit(vertex, k), port.rate))
            })
    }

    fn inflow(&self, port: &Port, flows: &[Fixed64]) -> Fixed64 {
        port.edge.map(|e| flows[e]).unwrap_or(Fixed64::ZERO)
    }

    /// Allocation of a split's inflow over its output slots, weighted by the
    /// per-link `weights`.
    fn split_shares(&self, vertex: &Vertex, flows: &[Fixed64], weights: &[Fixed64]) -> Vec<Fixed64> {
        let inflow = vertex
            .inputs
            .first()
            .map(|p| self.inflow(p, flows))
            .unwrap_or(Fixed64::ZERO);
        let demands: Vec<Fixed64> = (0..vertex.outputs.len())
            .map(|k| self.out_value(vertex, k, weights))
            .collect();
        fair_share(inflow, &demands)
    }

    /// Largest inflow a split can pass on without any share exceeding what
    /// its output link takes.
    fn split_intake(&self, vertex: &Vertex, weights: &[Fixed64], takes: &[Fixed64]) -> Fixed64 {
        let n = vertex.outputs.len();
        let demands: Vec<Fixed64> = (0..n).map(|k| self.out_value(vertex, k, weights)).collect();
        let takes: Vec<Fixed64> = (0..n).map(|k| self.out_value(vertex, k, takes)).collect();
        let fits = |total: Fixed64| {
            fair_share(total, &demands)
                .iter()
                .zip(&takes)
                .all(|(share, take)| share <= take)
        };
        let sum = |values: &[Fixed64]| values.iter().fold(Fixed64::ZERO, |acc, &v| add_rate(acc, v));
        let ceiling = sum(&takes).min(sum(&demands));
        if fits(ceiling) {
            return ceiling;
        }
        // Shares never shrink as the inflow grows, so bisect on the bits.
        let (mut lo, mut hi) = (0i64, ceiling.to_bits());
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if fits(Fixed64::from_bits(mid)) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Fixed64::from_bits(lo)
    }

    /// What the producer of `link` can put on it given the previous sweep.
    fn offer(&self, link: &Link, levels: &[Fixed64], flows: &[Fixed64], weights: &[Fixed64]) -> Fixed64 {
        let producer = &self.vertices[link.from];
        let offered = match producer.role {
            Role::Machine { .. } => mul_rate(levels[link.from], producer.outputs[link.from_port].rate),
            Role::Source { rate } => rate,
            Role::Merge => producer
                .inputs
                .iter()
                .fold(Fixed64::ZERO, |acc, p| add_rate(acc, self.inflow(p, flows))),
            Role::Split => self
                .split_shares(producer, flows, weights)
                .get(link.from_port)
                .copied()
                .unwrap_or(Fixed64::ZERO),
            Role::Sink { .. } => Fixed64::ZERO,
        };
        offered.min(link.limit)
    }

    /// Highest level a machine could hold given what its outputs take and
    /// the supply on every input except `skip`.
    fn potential(&self, vertex: &Vertex, skip: Option<usize>, supply: &[Fixed64], demands: &[Fixed64]) -> Fixed64 {
        let mut bound = self.level_cap(vertex).min(self.output_bound(vertex, demands));
        for (i, port) in vertex.inputs.iter().enumerate() {
            if Some(i) != skip {
                let available = add_rate(self.inflow(port, supply), port.stock_rate);
                bound = bound.min(div_rate(available, port.rate));
            }
        }
        bound
    }

    /// What the consumer of `link` would use if `link` itself were not the
    /// constraint.
    fn want(&self, link: &Link, supply: &[Fixed64], demands: &[Fixed64]) -> Fixed64 {
        let dest = &self.vertices[link.to];
        match dest.role {
            Role::Machine { .. } => {
                let level = self.potential(dest, Some(link.to_port), supply, demands);
                self.machine_take(dest, link.to_port, level)
            }
            Role::Sink { .. } => link.limit,
            Role::Merge => self.out_value(dest, 0, demands),
            Role::Split => (0..dest.outputs.len())
                .fold(Fixed64::ZERO, |acc, k| add_rate(acc, self.out_value(dest, k, demands))),
            Role::Source { .. } => Fixed64::ZERO,
        }
    }

    /// What the consumer of `link` takes at its current level.
    fn take(&self, link: &Link, levels: &[Fixed64], takes: &[Fixed64], demands: &[Fixed64]) -> Fixed64 {
        let dest = &self.vertices[link.to];
        match dest.role {
            Role::Machine { .. } => self.machine_take(dest, link.to_port, levels[link.to]),
            Role::Sink { .. } => link.limit,
            Role::Merge => self.out_value(dest, 0, takes),
            Role::Split => self.split_intake(dest, demands, takes),
            Role::Source { .. } => Fixed64::ZERO,
        }
    }

    /// Level the scarcest input allows: `min over inputs of supply / required`.
    fn input_bound(&self, vertex: &Vertex, flows: &[Fixed64]) -> Fixed64 {
        vertex.inputs.iter().fold(UNBOUNDED, |bound, port| {
            let supply = add_rate(self.inflow(port, flows), port.stock_rate);
            bound.min(div_rate(supply, port.rate))
        })
    }

    /// Scarcest input whose producer offers less than the machine asks of
    /// it. An unbound input is always short.
    fn short_input(
        &self,
        vertex: &Vertex,
        offers: &[Fixed64],
        demands: &[Fixed64],
        tolerance: Fixed64,
    ) -> Option<(Fixed64, usize)> {
        let mut scarcest: Option<(Fixed64, usize)> = None;
        for (i, port) in vertex.inputs.iter().enumerate() {
            let short = match port.edge {
                Some(e) => add_rate(offers[e], tolerance) < demands[e],
                None => true,
            };
            if !short {
                continue;
            }
            let supply = add_rate(self.inflow(port, offers), port.stock_rate);
            let level = div_rate(supply, port.rate);
            if scarcest.is_none_or(|(bound, _)| level < bound) {
                scarcest = Some((level, i));
            }
        }
        scarcest
    }

    fn relax(&self, ctx: &SolveContext<'_>) -> Result<Relaxed, Relaxed> {
        let mut sweeps = Sweeps {
            used: 0,
            max: ctx.max_iterations,
        };
        let limits: Vec<Fixed64> = self.links.iter().map(|l| l.limit).collect();

        let supply = self.forward(ctx, &limits, None, &mut sweeps)?;
        let demands = match self.backward(ctx, &supply.flows, &mut sweeps) {
            Ok(demands) => demands,
            Err(demands) => {
                return Err(Relaxed {
                    demands,
                    iterations: sweeps.used,
                    ..supply
                });
            }
        };
        self.forward(ctx, &demands, Some(demands.as_slice()), &mut sweeps)
    }

    /// Jacobi sweeps over machine levels and edge flows; splits divide by
    /// `weights`. With `demands`, each edge is also held to what its
    /// consumer takes at its current level and each machine to what its
    /// outputs take. Every quantity is non-increasing.
    fn forward(
        &self,
        ctx: &SolveContext<'_>,
        weights: &[Fixed64],
        demands: Option<&[Fixed64]>,
        sweeps: &mut Sweeps,
    ) -> Result<Relaxed, Relaxed> {
        let start = demands.unwrap_or(weights);
        let mut levels: Vec<Fixed64> = self.vertices.iter().map(|v| self.level_cap(v)).collect();
        let mut flows: Vec<Fixed64> = start.to_vec();
        let mut takes: Vec<Fixed64> = start.to_vec();

        while sweeps.next() {
            let next_takes: Vec<Fixed64> = match demands {
                Some(demands) => self
                    .links
                    .iter()
                    .enumerate()
                    .map(|(e, link)| takes[e].min(self.take(link, &levels, &takes, demands)))
                    .collect(),
                None => takes.clone(),
            };
            let next_flows: Vec<Fixed64> = self
                .links
                .iter()
                .enumerate()
                .map(|(e, link)| {
                    flows[e]
                        .min(self.offer(link, &levels, &flows, weights))
                        .min(next_takes[e])
                })
                .collect();
            let next_levels: Vec<Fixed64> = self
                .vertices
                .iter()
                .enumerate()
                .map(|(n, vertex)| match vertex.role {
                    Role::Machine { .. } => {
                        let level = levels[n].min(self.input_bound(vertex, &next_flows));
                        match demands {
                            Some(_) => level.min(self.output_bound(vertex, &next_takes)),
                            None => level,
                        }
                    }
                    _ => levels[n],
                })
                .collect();

            let delta = max_delta(
                levels
                    .iter()
                    .zip(&next_levels)
                    .chain(flows.iter().zip(&next_flows))
                    .chain(takes.iter().zip(&next_takes)),
            );
            levels = next_levels;
            flows = next_flows;
            takes = next_takes;
            if delta <= ctx.tolerance {
                return Ok(Relaxed {
                    levels,
                    flows,
                    demands: start.to_vec(),
                    iterations: sweeps.used,
                });
            }
        }
        Err(Relaxed {
            levels,
            flows,
            demands: start.to_vec(),
            iterations: sweeps.used,
        })
    }

    /// Backward fixed point for demands: each edge asks for what its
    /// consumer could use if that edge were not the constraint, given the
    /// supply potential on every other edge.
    fn backward(
        &self,
        ctx: &SolveContext<'_>,
        supply: &[Fixed64],
        sweeps: &mut Sweeps,
    ) -> Result<Vec<Fixed64>, Vec<Fixed64>> {
        let mut demands: Vec<Fixed64> = self.links.iter().map(|l| l.limit).collect();
        while sweeps.next() {
            let next: Vec<Fixed64> = self
                .links
                .iter()
                .enumerate()
                .map(|(e, link)| demands[e].min(self.want(link, supply, &demands)))
                .collect();
            let delta = max_delta(demands.iter().zip(&next));
            demands = next;
            if delta <= ctx.tolerance {
                return Ok(demands);
            }
        }
        Err(demands)
    }

    /// Turn relaxed levels and flows into per-node and per-edge results.
    fn report(&self, relaxed: &Relaxed, tolerance: Fixed64, out: &mut ComponentResult) {
        let Relaxed {
            levels,
            flows,
            demands,
            ..
        } = relaxed;

        // Machines take no more than they use at the final level and ship
        // no more than they make.
        let mut carried = flows.clone();
        for (e, link) in self.links.iter().enumerate() {
            let consumer = &self.vertices[link.to];
            if let Role::Machine { .. } = consumer.role {
                carried[e] = carried[e].min(self.machine_take(consumer, link.to_port, levels[link.to]));
            }
            let producer = &self.vertices[link.from];
            if let Role::Machine { .. } = producer.role {
                let made = mul_rate(levels[link.from], producer.outputs[link.from_port].rate);
                carried[e] = carried[e].min(made);
            }
        }

        let offers: Vec<Fixed64> = self
            .links
            .iter()
            .map(|link| self.offer(link, levels, flows, demands))
            .collect();

        // Ration merge inputs; every other edge carries its relaxed flow.
        let mut shipped = carried.clone();
        for vertex in &self.vertices {
            if let Role::Merge = vertex.role {
                let offers: Vec<Fixed64> = vertex.inputs.iter().map(|p| self.inflow(p, &carried)).collect();
                let total = vertex
                    .outputs
                    .first()
                    .and_then(|p| p.edge)
                    .map(|e| carried[e])
                    .unwrap_or(UNBOUNDED);
                let shares = fair_share(total, &offers);
                for (port, share) in vertex.inputs.iter().zip(shares) {
                    if let Some(e) = port.edge {
                        shipped[e] = share;
                    }
                }
            }
        }

        for (e, link) in self.links.iter().enumerate() {
            out.edges.push((
                link.id,
                EdgeFlow {
                    item: link.item,
                    rate: shipped[e],
                    limit: link.limit,
                },
            ));
        }

        for (n, vertex) in self.vertices.iter().enumerate() {
            let shipped_on = |port: &Port| port.edge.map(|e| shipped[e]).unwrap_or(Fixed64::ZERO);
            let flow = match vertex.role {
                Role::Machine { multiplier } => {
                    let level = levels[n];
                    let inputs = vertex
                        .inputs
                        .iter()
                        .map(|port| {
                            let supplied = add_rate(shipped_on(port), port.stock_rate);
                            let required = mul_rate(level, port.rate);
                            InputFlow {
                                item: port.item,
                                edge: port.edge.map(|e| self.links[e].id),
                                supplied,
                                required,
                                surplus: sub_floor(supplied, required),
                            }
                        })
                        .collect();
                    let outputs = self.output_flows(vertex, &shipped, |port| mul_rate(level, port.rate));

                    // Below the multiplier: short of an input it asks more
                    // of, or held back by what its outputs take.
                    let mut limiting_item = None;
                    let mut output_bound = false;
                    if level < multiplier - tolerance.min(multiplier) {
                        match self.short_input(vertex, &offers, demands, tolerance) {
                            Some((bound, i)) if bound <= add_rate(level, tolerance) => {
                                limiting_item = Some(vertex.inputs[i].item);
                            }
                            _ => output_bound = true,
                        }
                    }
                    NodeFlow {
                        level,
                        max_level: multiplier,
                        inputs,
                        outputs,
                        limiting_item,
                        output_bound,
                    }
                }
                Role::Source { rate } => {
                    let produced = vertex
                        .outputs
                        .first()
                        .and_then(|p| p.edge)
                        .map(|e| carried[e])
                        .unwrap_or(Fixed64::ZERO);
                    NodeFlow {
                        level: produced,
                        max_level: rate,
                        inputs: Vec::new(),
                        outputs: self.output_flows(vertex, &shipped, |_| produced),
                        limiting_item: None,
                        output_bound: false,
                    }
                }
                Role::Sink { rate } => {
                    let inputs: Vec<InputFlow> = vertex
                        .inputs
                        .iter()
                        .map(|port| {
                            let supplied = shipped_on(port);
                            InputFlow {
                                item: port.item,
                                edge: port.edge.map(|e| self.links[e].id),
                                supplied,
                                required: supplied,
                                surplus: Fixed64::ZERO,
                            }
                        })
                        .collect();
                    NodeFlow {
                        level: inputs.iter().fold(Fixed64::ZERO, |acc, i| add_rate(acc, i.supplied)),
                        max_level: rate,
                        inputs,
                        outputs: Vec::new(),
                        limiting_item: None,
                        output_bound: false,
                    }
                }
                Role::Merge | Role::Split => {
                    let inputs: Vec<InputFlow> = vertex
                        .inputs
                        .iter()
                        .map(|port| {
                            let supplied = shipped_on(port);
                            InputFlow {
                                item: port.item,
                                edge: port.edge.map(|e| self.links[e].id),
                                supplied,
                                required: supplied,
                                surplus: Fixed64::ZERO,
                            }
                        })
                        .collect();
                    let through = inputs.iter().fold(Fixed64::ZERO, |acc, i| add_rate(acc, i.supplied));
                    let produced: Vec<Fixed64> = match vertex.role {
                        Role::Split => self.split_shares(vertex, &shipped, demands),
                        _ => vec![through],
                    };
                    let outputs = vertex
                        .outputs
                        .iter()
                        .zip(&produced)
                        .map(|(port, &produced)| {
                            let sent = shipped_on(port);
                            OutputFlow {
                                item: port.item,
                                edge: port.edge.map(|e| self.links[e].id),
                                produced,
                                shipped: sent,
                                surplus: sub_floor(produced, sent),
                            }
                        })
                        .collect();
                    let max_level = match vertex.role {
                        Role::Merge => self.out_limit(vertex, 0),
                        _ => vertex
                            .inputs
                            .first()
                            .and_then(|p| p.edge)
                            .map(|e| self.links[e].limit)
                            .unwrap_or(Fixed64::ZERO),
                    };
                    NodeFlow {
                        level: through,
                        max_level,
                        inputs,
                        outputs,
                        limiting_item: None,
                        output_bound: false,
                    }
                }
            };
            out.nodes.push((vertex.id, flow));
        }
    }

    fn output_flows(
        &self,
        vertex: &Vertex,
        shipped: &[Fixed64],
        produced: impl Fn(&Port) -> Fixed64,
    ) -> Vec<OutputFlow> {
        vertex
            .outputs
            .iter()
            .map(|port| {
                let produced = produced(port);
                let sent = port.edge.map(|e| shipped[e]).unwrap_or(Fixed64::ZERO);
                OutputFlow {
                    item: port.item,
                    edge: port.edge.map(|e| self.links[e].id),
                    produced,
                    shipped: sent,
                    surplus: sub_floor(produced, sent),
                }
            })
            .collect()
    }

    fn machine_levels(&self, levels: &[Fixed64]) -> Vec<(NodeId, Fixed64)> {
        self.vertices
            .iter()
            .zip(levels)
            .filter(|(v, _)| matches!(v.role, Role::Machine { .. }))
            .map(|(v, &l)| (v.id, l))
            .collect()
    }
}

struct Relaxed {
    levels: Vec<Fixed64>,
    flows: Vec<Fixed64>,
    /// What each edge's consumer asks of it.
    demands: Vec<Fixed64>,
    iterations: u32,
}

/// Sweep budget shared by every pass over one component.
struct Sweeps {
    used: u32,
    max: u32,
}

impl Sweeps {
    fn next(&mut self) -> bool {
        if self.used < self.max {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

fn max_delta<'a>(pairs: impl Iterator<Item = (&'a Fixed64, &'a Fixed64)>) -> Fixed64 {
    pairs
        .map(|(&a, &b)| abs_diff(a, b))
        .max()
        .unwrap_or(Fixed64::ZERO)
}

#[derive(Default)]
struct ComponentResult {
    nodes: Vec<(NodeId, NodeFlow)>,
    edges: Vec<(EdgeId, EdgeFlow)>,
    iterations: u32,
    machine_levels: Vec<(NodeId, Fixed64)>,
    /// Set when the sweep budget ran out.
    stalled: bool,
}

fn solve_component(graph: &ProductionGraph, ctx: &SolveContext<'_>, members: &[NodeId]) -> ComponentResult {
    let network = Network::lower(graph, ctx, members);
    let mut result = ComponentResult::default();
    let (relaxed, stalled) = match network.relax(ctx) {
        Ok(relaxed) => (relaxed, false),
        Err(relaxed) => (relaxed, true),
    };
    result.iterations = relaxed.iterations;
    result.machine_levels = network.machine_levels(&relaxed.levels);
    result.stalled = stalled;
    if !stalled {
        network.report(&relaxed, ctx.tolerance, &mut result);
    }
    result
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Solve the graph. Fails only when a component exhausts the sweep budget.
pub fn solve(graph: &ProductionGraph, ctx: &SolveContext<'_>) -> Result<FlowSolution, SolveError> {
    let components = graph.components();

    #[cfg(feature = "parallel")]
    let results: Vec<ComponentResult> = components
        .par_iter()
        .map(|members| solve_component(graph, ctx, members))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let results: Vec<ComponentResult> = components
        .iter()
        .map(|members| solve_component(graph, ctx, members))
        .collect();

    assemble(results, components.len(), ctx.tolerance)
}

/// Solve components one after another on the calling thread.
pub fn solve_sequential(
    graph: &ProductionGraph,
    ctx: &SolveContext<'_>,
) -> Result<FlowSolution, SolveError> {
    let components = graph.components();
    let results = components
        .iter()
        .map(|members| solve_component(graph, ctx, members))
        .collect();
    assemble(results, components.len(), ctx.tolerance)
}

/// Steady-state solve with default configuration.
pub fn solve_steady(graph: &ProductionGraph) -> Result<FlowSolution, SolveError> {
    solve(graph, &SolveContext::default())
}

fn assemble(
    results: Vec<ComponentResult>,
    components: usize,
    tolerance: Fixed64,
) -> Result<FlowSolution, SolveError> {
    let iterations = results.iter().map(|r| r.iterations).max().unwrap_or(0);
    if results.iter().any(|r| r.stalled) {
        let mut last_levels: Vec<(NodeId, Fixed64)> = results
            .into_iter()
            .flat_map(|r| r.machine_levels)
            .collect();
        last_levels.sort_by_key(|(id, _)| *id);
        tracing::warn!(iterations, "flow solver did not converge");
        return Err(SolveError::SolverDidNotConverge {
            iterations,
            last_levels,
        });
    }

    let mut solution = FlowSolution {
        edges: BTreeMap::new(),
        nodes: BTreeMap::new(),
        iterations,
        components: components as u32,
        tolerance,
    };
    for result in results {
        solution.nodes.extend(result.nodes);
        solution.edges.extend(result.edges);
    }
    tracing::debug!(
        components,
        iterations,
        nodes = solution.nodes.len(),
        edges = solution.edges.len(),
        "solved production graph"
    );
    Ok(solution)
}

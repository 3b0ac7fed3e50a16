//! fasim core -- production-flow simulation for factory-building games.
//!
//! This crate provides the recipe catalog, the production graph, a
//! steady-state flow solver, bottleneck analysis and an incremental
//! time-stepped driver, all on deterministic fixed-point arithmetic.
//!
//! # Pipeline
//!
//! ```text
//! RecipeCatalog --> ProductionGraph --> solve() --> analyze()
//!                         \                 \           /
//!                          `-- SimulationDriver (time loop, snapshots)
//! ```
//!
//! 1. **Catalog** -- recipes are registered into a [`catalog::CatalogBuilder`]
//!    and sealed into an immutable [`catalog::RecipeCatalog`].
//! 2. **Graph** -- machines, sources, sinks, merges and splits are wired
//!    slot to slot in a [`graph::ProductionGraph`]. Cycles are allowed.
//! 3. **Solve** -- [`solver::solve`] finds every edge rate and machine
//!    level, honoring capacities and backpressure.
//! 4. **Analyze** -- [`analyzer::analyze`] classifies machines and ranks
//!    bottlenecks by how much production they hold back.
//! 5. **Drive** -- [`driver::SimulationDriver`] repeats 3 and 4 every step,
//!    moving items through buffers and publishing
//!    [`snapshot::SimulationSnapshot`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! let catalog = Arc::new(builder.seal());
//! let mut graph = ProductionGraph::new(catalog);
//! let ore = graph.add_source(iron_ore, None)?;
//! let smelter = graph.add_node_by_name("smelt_iron", Fixed64::from_num(2))?;
//! graph.connect(ore, iron_ore, smelter, iron_ore, None)?;
//! let solution = solve_steady(&graph)?;
//! ```
//!
//! # Key Types
//!
//! - [`rate::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`catalog::RecipeCatalog`] -- Immutable item and recipe registry.
//! - [`graph::ProductionGraph`] -- Nodes, slot-bound edges and a revision.
//! - [`solver::FlowSolution`] -- Edge rates, node levels, surplus and limits.
//! - [`analyzer::Finding`] -- Per-machine classification and severity.
//! - [`driver::SimulationDriver`] -- Lifecycle, buffers, history, rollback.
//! - [`serialize`] -- Versioned binary encoding via bitcode.

pub mod analyzer;
pub mod catalog;
pub mod driver;
pub mod graph;
pub mod id;
pub mod rate;
pub mod serialize;
pub mod sim;
pub mod snapshot;
pub mod solver;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

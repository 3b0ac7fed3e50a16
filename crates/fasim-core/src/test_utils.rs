//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::catalog::{CatalogBuilder, RecipeCatalog, RecipeDefinition, RecipeEntry};
use crate::graph::ProductionGraph;
use crate::id::*;
use crate::rate::Fixed64;
use std::sync::Arc;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Assert two fixed-point values agree to within `1e-6`.
#[track_caller]
pub fn assert_close(actual: Fixed64, expected: f64) {
    let diff = (actual.to_num::<f64>() - expected).abs();
    assert!(
        diff < 1e-6,
        "expected {expected}, got {actual} (diff {diff})"
    );
}

// ===========================================================================
// Test catalog
// ===========================================================================

/// Item names in registration order; `ItemKind(i)` is `ITEMS[i]`.
pub const ITEMS: [&str; 7] = [
    "iron_ore",
    "iron_plate",
    "copper_ore",
    "copper_plate",
    "gear",
    "circuit",
    "slag",
];

pub fn item(name: &str) -> ItemKind {
    let index = ITEMS
        .iter()
        .position(|n| *n == name)
        .unwrap_or_else(|| panic!("unknown test item {name}"));
    ItemKind(index as u32)
}

fn entry(name: &str, quantity: f64) -> RecipeEntry {
    RecipeEntry::new(item(name), fixed(quantity))
}

/// Recipes used throughout the tests:
///
/// | recipe         | inputs                    | outputs              | secs |
/// |----------------|---------------------------|----------------------|------|
/// | `smelt_iron`   | 1 iron_ore                | 1 iron_plate         | 1    |
/// | `smelt_copper` | 1 copper_ore              | 1 copper_plate       | 1    |
/// | `make_gear`    | 2 iron_plate              | 1 gear               | 1    |
/// | `make_circuit` | 1 gear, 2 copper_plate    | 1 circuit            | 2    |
/// | `refine_iron`  | 2 iron_ore                | 1 iron_plate, 1 slag | 1    |
/// | `reclaim_slag` | 1 slag                    | 0.5 iron_ore         | 1    |
/// | `polish_plate` | 1 iron_plate              | 1 iron_plate         | 1    |
pub fn catalog_builder() -> CatalogBuilder {
    let mut builder = CatalogBuilder::new();
    for name in ITEMS {
        builder.register_item(name);
    }
    let recipes = [
        RecipeDefinition::new(
            "smelt_iron",
            vec![entry("iron_ore", 1.0)],
            vec![entry("iron_plate", 1.0)],
            fixed(1.0),
        ),
        RecipeDefinition::new(
            "smelt_copper",
            vec![entry("copper_ore", 1.0)],
            vec![entry("copper_plate", 1.0)],
            fixed(1.0),
        ),
        RecipeDefinition::new(
            "make_gear",
            vec![entry("iron_plate", 2.0)],
            vec![entry("gear", 1.0)],
            fixed(1.0),
        ),
        RecipeDefinition::new(
            "make_circuit",
            vec![entry("gear", 1.0), entry("copper_plate", 2.0)],
            vec![entry("circuit", 1.0)],
            fixed(2.0),
        ),
        RecipeDefinition::new(
            "refine_iron",
            vec![entry("iron_ore", 2.0)],
            vec![entry("iron_plate", 1.0), entry("slag", 1.0)],
            fixed(1.0),
        ),
        RecipeDefinition::new(
            "reclaim_slag",
            vec![entry("slag", 1.0)],
            vec![entry("iron_ore", 0.5)],
            fixed(1.0),
        ),
        RecipeDefinition::new(
            "polish_plate",
            vec![entry("iron_plate", 1.0)],
            vec![entry("iron_plate", 1.0)],
            fixed(1.0),
        ),
    ];
    for recipe in recipes {
        builder.register(recipe).expect("test recipe is valid");
    }
    builder
}

pub fn test_catalog() -> Arc<RecipeCatalog> {
    Arc::new(catalog_builder().seal())
}

pub fn recipe(name: &str) -> RecipeId {
    test_catalog()
        .recipe_id(name)
        .unwrap_or_else(|| panic!("unknown test recipe {name}"))
}

pub fn new_graph() -> ProductionGraph {
    ProductionGraph::new(test_catalog())
}

// ===========================================================================
// Wiring helpers
// ===========================================================================

/// Unbounded edge carrying `item_name` from `from` to `to`.
pub fn connect(graph: &mut ProductionGraph, from: NodeId, to: NodeId, item_name: &str) -> EdgeId {
    let kind = item(item_name);
    graph
        .connect(from, kind, to, kind, None)
        .expect("test edge is valid")
}

pub fn connect_capped(
    graph: &mut ProductionGraph,
    from: NodeId,
    to: NodeId,
    item_name: &str,
    capacity: f64,
) -> EdgeId {
    let kind = item(item_name);
    graph
        .connect(from, kind, to, kind, Some(fixed(capacity)))
        .expect("test edge is valid")
}

pub fn machine(graph: &mut ProductionGraph, recipe_name: &str, multiplier: f64) -> NodeId {
    graph
        .add_node_by_name(recipe_name, fixed(multiplier))
        .expect("test machine is valid")
}

pub fn source(graph: &mut ProductionGraph, item_name: &str, rate: Option<f64>) -> NodeId {
    graph
        .add_source(item(item_name), rate.map(fixed))
        .expect("test source is valid")
}

pub fn sink(graph: &mut ProductionGraph, item_name: &str, rate: Option<f64>) -> NodeId {
    graph
        .add_sink(item(item_name), rate.map(fixed))
        .expect("test sink is valid")
}

// ===========================================================================
// Reference lines
// ===========================================================================

/// Nodes of a source -> machine -> sink line.
#[derive(Debug, Clone, Copy)]
pub struct SimpleLine {
    pub source: NodeId,
    pub machine: NodeId,
    pub sink: NodeId,
    pub ore_edge: EdgeId,
    pub plate_edge: EdgeId,
}

/// Iron ore source (`None` = unbounded) -> `smelt_iron` x multiplier -> sink.
pub fn smelter_line(source_rate: Option<f64>, multiplier: f64) -> (ProductionGraph, SimpleLine) {
    let mut graph = new_graph();
    let src = source(&mut graph, "iron_ore", source_rate);
    let smelter = machine(&mut graph, "smelt_iron", multiplier);
    let out = sink(&mut graph, "iron_plate", None);
    let ore_edge = connect(&mut graph, src, smelter, "iron_ore");
    let plate_edge = connect(&mut graph, smelter, out, "iron_plate");
    (
        graph,
        SimpleLine {
            source: src,
            machine: smelter,
            sink: out,
            ore_edge,
            plate_edge,
        },
    )
}

/// Same as [`smelter_line`] but the sink stores plates in a buffer of
/// `storage` items and never drains it.
pub fn storage_line(storage: f64) -> (ProductionGraph, SimpleLine) {
    let (mut graph, line) = smelter_line(None, 1.0);
    graph
        .set_buffer_capacity(line.sink, item("iron_plate"), fixed(storage))
        .expect("sink consumes plates");
    (graph, line)
}

/// Nodes of the recycling loop.
#[derive(Debug, Clone, Copy)]
pub struct RecyclingLoop {
    pub source: NodeId,
    pub merge: NodeId,
    pub refinery: NodeId,
    pub reclaimer: NodeId,
    pub sink: NodeId,
}

/// Ore (1/s) and reclaimed ore merge into a refinery (2 ore -> plate + slag);
/// slag goes to a reclaimer (1 slag -> 0.5 ore) that feeds the merge.
/// Both machines settle at level 2/3.
pub fn recycling_loop() -> (ProductionGraph, RecyclingLoop) {
    let mut graph = new_graph();
    let src = source(&mut graph, "iron_ore", Some(1.0));
    let merge = graph
        .add_merge(item("iron_ore"), 2)
        .expect("merge is valid");
    let refinery = machine(&mut graph, "refine_iron", 1.0);
    let reclaimer = machine(&mut graph, "reclaim_slag", 1.0);
    let out = sink(&mut graph, "iron_plate", None);
    connect(&mut graph, src, merge, "iron_ore");
    connect(&mut graph, reclaimer, merge, "iron_ore");
    connect(&mut graph, merge, refinery, "iron_ore");
    connect(&mut graph, refinery, out, "iron_plate");
    connect(&mut graph, refinery, reclaimer, "slag");
    (
        graph,
        RecyclingLoop {
            source: src,
            merge,
            refinery,
            reclaimer,
            sink: out,
        },
    )
}

// ===========================================================================
// Larger lines for benchmarks and stress tests
// ===========================================================================

/// Ore source -> smelter -> `length - 1` polishers -> sink.
pub fn build_chain_line(length: usize) -> ProductionGraph {
    let mut graph = new_graph();
    let src = source(&mut graph, "iron_ore", Some(1.0));
    let mut prev = machine(&mut graph, "smelt_iron", 1.0);
    connect(&mut graph, src, prev, "iron_ore");
    for _ in 1..length {
        let next = machine(&mut graph, "polish_plate", 1.0);
        connect(&mut graph, prev, next, "iron_plate");
        prev = next;
    }
    let out = sink(&mut graph, "iron_plate", None);
    connect(&mut graph, prev, out, "iron_plate");
    graph
}

/// Ore source -> split into `fan_out` smelters -> merge -> sink.
pub fn build_wide_line(fan_out: usize) -> ProductionGraph {
    let mut graph = new_graph();
    let width = fan_out.max(1) as u32;
    let src = source(&mut graph, "iron_ore", Some(fan_out as f64 * 0.75));
    let split = graph
        .add_split(item("iron_ore"), width)
        .expect("split is valid");
    let merge = graph
        .add_merge(item("iron_plate"), width)
        .expect("merge is valid");
    let out = sink(&mut graph, "iron_plate", None);
    connect(&mut graph, src, split, "iron_ore");
    for _ in 0..width {
        let smelter = machine(&mut graph, "smelt_iron", 1.0);
        connect(&mut graph, split, smelter, "iron_ore");
        connect(&mut graph, smelter, merge, "iron_plate");
    }
    connect(&mut graph, merge, out, "iron_plate");
    graph
}

/// `count` independent recycling loops in one graph.
pub fn build_loop_field(count: usize) -> ProductionGraph {
    let mut graph = new_graph();
    for _ in 0..count {
        let src = source(&mut graph, "iron_ore", Some(1.0));
        let merge = graph
            .add_merge(item("iron_ore"), 2)
            .expect("merge is valid");
        let refinery = machine(&mut graph, "refine_iron", 1.0);
        let reclaimer = machine(&mut graph, "reclaim_slag", 1.0);
        let out = sink(&mut graph, "iron_plate", None);
        connect(&mut graph, src, merge, "iron_ore");
        connect(&mut graph, reclaimer, merge, "iron_ore");
        connect(&mut graph, merge, refinery, "iron_ore");
        connect(&mut graph, refinery, out, "iron_plate");
        connect(&mut graph, refinery, reclaimer, "slag");
    }
    graph
}

//! Smelting line example: an ore source feeding two smelters through a
//! split, with the plates stored in a sink that fills up.
//!
//! Builds a catalog, wires the line, prints the steady-state bottleneck
//! ranking, then drives the line until storage is full.
//!
//! Run with: `cargo run -p fasim-core --example smelting_line`

use fasim_core::analyzer::{Classification, analyze};
use fasim_core::catalog::{CatalogBuilder, RecipeDefinition, RecipeEntry};
use fasim_core::driver::{DriverConfig, SimulationDriver};
use fasim_core::graph::ProductionGraph;
use fasim_core::rate::Fixed64;
use fasim_core::solver::solve_steady;
use std::sync::Arc;

fn main() {
    // --- Catalog ---

    let mut builder = CatalogBuilder::new();
    let ore = builder.register_item("iron_ore");
    let plate = builder.register_item("iron_plate");
    builder
        .register(RecipeDefinition::new(
            "smelt_iron",
            vec![RecipeEntry::new(ore, Fixed64::from_num(1))],
            vec![RecipeEntry::new(plate, Fixed64::from_num(1))],
            Fixed64::from_num(2),
        ))
        .expect("recipe is valid");
    let catalog = Arc::new(builder.seal());

    // --- Line: ore (0.75/s) -> split -> 2 smelters -> merge -> storage ---

    let mut graph = ProductionGraph::new(catalog);
    let source = graph.add_source(ore, Some(Fixed64::from_num(0.75))).unwrap();
    let split = graph.add_split(ore, 2).unwrap();
    let left = graph.add_node_by_name("smelt_iron", Fixed64::ONE).unwrap();
    let right = graph.add_node_by_name("smelt_iron", Fixed64::ONE).unwrap();
    let merge = graph.add_merge(plate, 2).unwrap();
    let storage = graph.add_sink(plate, None).unwrap();
    graph.set_label(left, "left smelter").unwrap();
    graph.set_label(right, "right smelter").unwrap();
    graph
        .set_buffer_capacity(storage, plate, Fixed64::from_num(3))
        .unwrap();

    graph.connect(source, ore, split, ore, None).unwrap();
    graph.connect(split, ore, left, ore, None).unwrap();
    graph.connect(split, ore, right, ore, None).unwrap();
    graph.connect(left, plate, merge, plate, None).unwrap();
    graph.connect(right, plate, merge, plate, None).unwrap();
    graph.connect(merge, plate, storage, plate, None).unwrap();

    // --- Steady state ---

    let solution = solve_steady(&graph).unwrap();
    println!("steady state after {} sweeps:", solution.iterations);
    for finding in analyze(&solution, &graph) {
        let label = graph
            .node(finding.node)
            .and_then(|n| n.label.as_deref())
            .unwrap_or("?");
        let why = match finding.classification {
            Classification::Saturated => "saturated".to_string(),
            Classification::Starved { limiting_item } => {
                format!("starved of {}", graph.catalog().item_name(limiting_item))
            }
            Classification::Balanced => "balanced".to_string(),
        };
        println!(
            "  {label}: level {:.3} of {} ({why})",
            finding.level.to_num::<f64>(),
            finding.multiplier
        );
    }

    // --- Time steps until storage fills ---

    let mut driver = SimulationDriver::new(graph, DriverConfig::default()).unwrap();
    driver.start().unwrap();
    for _ in 0..8 {
        let snap = driver.step().unwrap();
        println!(
            "step {}: stored {:.2}, left smelter level {:.3}",
            snap.step,
            snap.buffer(storage, plate).to_num::<f64>(),
            snap.level(left).unwrap_or(Fixed64::ZERO).to_num::<f64>()
        );
    }
    driver.stop().unwrap();
}

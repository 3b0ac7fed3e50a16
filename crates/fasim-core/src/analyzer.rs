//! Bottleneck and imbalance analysis over a solved graph.
//!
//! Every machine gets a [`Finding`]. Starved machines are traced backward
//! along their limiting input to find the machines whose shortfall they
//! inherit; each machine's `impact` counts how many starved machines trace
//! back to it. Findings are ranked by
//! `severity = (multiplier - level) * impact`, so the machine whose fix
//! unblocks the most production comes first.

use crate::graph::{NodeKind, ProductionGraph};
use crate::id::*;
use crate::rate::*;
use crate::solver::FlowSolution;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Running at its multiplier. Expansion candidate.
    Saturated,
    /// Held below its multiplier by an input.
    Starved { limiting_item: ItemKind },
    /// Held below its multiplier by its outputs, or idle with no demand.
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub node: NodeId,
    pub classification: Classification,
    pub level: Fixed64,
    pub multiplier: Fixed64,
    /// 1 + number of starved machines whose shortage traces back here.
    pub impact: u32,
    pub severity: Fixed64,
}

/// Classify and rank every machine. Ordered by severity, highest first,
/// then by node id.
pub fn analyze(solution: &FlowSolution, graph: &ProductionGraph) -> Vec<Finding> {
    let mut classified: Vec<(NodeId, Classification, Fixed64, Fixed64)> = Vec::new();
    for (id, data) in graph.nodes() {
        let NodeKind::Machine { multiplier, .. } = data.kind else {
            continue;
        };
        let Some(flow) = solution.node(id) else {
            continue;
        };
        let classification = match flow.limiting_item {
            Some(limiting_item) => Classification::Starved { limiting_item },
            None if flow.output_bound => Classification::Balanced,
            None => Classification::Saturated,
        };
        classified.push((id, classification, flow.level, multiplier));
    }

    let mut impact: BTreeMap<NodeId, u32> = BTreeMap::new();
    for &(id, classification, _, _) in &classified {
        if let Classification::Starved { .. } = classification {
            for upstream in upstream_causes(solution, graph, id) {
                *impact.entry(upstream).or_insert(0) += 1;
            }
        }
    }

    let mut findings: Vec<Finding> = classified
        .into_iter()
        .map(|(node, classification, level, multiplier)| {
            let impact = 1 + impact.get(&node).copied().unwrap_or(0);
            let severity = mul_rate(sub_floor(multiplier, level), Fixed64::from_num(impact));
            Finding {
                node,
                classification,
                level,
                multiplier,
                impact,
                severity,
            }
        })
        .collect();
    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.node.cmp(&b.node)));

    tracing::debug!(findings = findings.len(), "analyzed flow solution");
    findings
}

/// Machines reached by walking backward from a starved machine along
/// limiting inputs. Merges and splits pass the walk through to all of
/// their inputs; a machine that is not itself starved ends its branch.
fn upstream_causes(solution: &FlowSolution, graph: &ProductionGraph, start: NodeId) -> Vec<NodeId> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut reached = Vec::new();
    let mut stack = vec![start];
    visited.insert(start);

    while let Some(node) = stack.pop() {
        let Some(data) = graph.node(node) else { continue };
        let feeding: Vec<EdgeId> = match &data.kind {
            NodeKind::Machine { .. } => {
                let limiting = solution.node(node).and_then(|f| f.limiting_item);
                graph
                    .input_slots(node)
                    .iter()
                    .filter(|slot| Some(slot.item) == limiting)
                    .filter_map(|slot| slot.edge)
                    .collect()
            }
            NodeKind::Merge { .. } | NodeKind::Split { .. } => graph.input_edges(node).collect(),
            NodeKind::Source { .. } | NodeKind::Sink { .. } => Vec::new(),
        };
        for edge in feeding {
            let Some(producer) = graph.edge(edge).map(|e| e.from) else {
                continue;
            };
            if !visited.insert(producer) {
                continue;
            }
            if graph.node(producer).is_some_and(|d| d.kind.is_machine()) {
                reached.push(producer);
            }
            stack.push(producer);
        }
    }
    reached
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub saturated: usize,
    pub starved: usize,
    pub balanced: usize,
    /// Highest-severity starved or balanced finding, if any has severity.
    pub top: Option<Finding>,
}

pub fn summarize(findings: &[Finding]) -> Summary {
    let mut summary = Summary::default();
    for finding in findings {
        match finding.classification {
            Classification::Saturated => summary.saturated += 1,
            Classification::Starved { .. } => summary.starved += 1,
            Classification::Balanced => summary.balanced += 1,
        }
    }
    summary.top = findings
        .first()
        .filter(|f| f.severity > Fixed64::ZERO)
        .cloned();
    summary
}

/// Net supply against demand for one item kind across the whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemBalance {
    pub item: ItemKind,
    /// Source output plus machine production.
    pub produced: Rate,
    /// Machine consumption plus sink intake.
    pub consumed: Rate,
    /// Machine consumption if every machine ran at its multiplier.
    pub demand: Rate,
    /// Produced but never consumed.
    pub surplus: Rate,
    /// Machine demand left unmet.
    pub deficit: Rate,
}

/// Per-item surplus/deficit view, ordered by item kind. Merges and splits
/// only route items and are not counted.
pub fn item_balance(solution: &FlowSolution, graph: &ProductionGraph) -> Vec<ItemBalance> {
    #[derive(Default)]
    struct Totals {
        produced: Fixed64,
        consumed: Fixed64,
        machine_consumed: Fixed64,
        demand: Fixed64,
    }
    let mut totals: BTreeMap<ItemKind, Totals> = BTreeMap::new();

    for (id, data) in graph.nodes() {
        let Some(flow) = solution.node(id) else { continue };
        match &data.kind {
            NodeKind::Machine { multiplier, .. } => {
                let recipe = graph.recipe_of(id);
                for output in &flow.outputs {
                    let t = totals.entry(output.item).or_default();
                    t.produced = add_rate(t.produced, output.produced);
                }
                for input in &flow.inputs {
                    let full = recipe
                        .and_then(|r| r.input_rate(input.item))
                        .map(|r| mul_rate(r, *multiplier))
                        .unwrap_or(Fixed64::ZERO);
                    let t = totals.entry(input.item).or_default();
                    t.consumed = add_rate(t.consumed, input.required);
                    t.machine_consumed = add_rate(t.machine_consumed, input.required);
                    t.demand = add_rate(t.demand, full);
                }
            }
            NodeKind::Source { item, .. } => {
                let t = totals.entry(*item).or_default();
                t.produced = add_rate(t.produced, flow.level);
            }
            NodeKind::Sink { item, .. } => {
                let t = totals.entry(*item).or_default();
                t.consumed = add_rate(t.consumed, flow.level);
            }
            NodeKind::Merge { .. } | NodeKind::Split { .. } => {}
        }
    }

    totals
        .into_iter()
        .map(|(item, t)| ItemBalance {
            item,
            produced: t.produced,
            consumed: t.consumed,
            demand: t.demand,
            surplus: sub_floor(t.produced, t.consumed),
            deficit: sub_floor(t.demand, t.machine_consumed),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::solve_steady;
    use crate::test_utils::*;

    fn finding(findings: &[Finding], node: NodeId) -> &Finding {
        findings
            .iter()
            .find(|f| f.node == node)
            .expect("machine has a finding")
    }

    #[test]
    fn full_speed_machine_is_saturated() {
        let (graph, line) = smelter_line(None, 2.0);
        let solution = solve_steady(&graph).unwrap();
        let findings = analyze(&solution, &graph);

        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.node, line.machine);
        assert_eq!(f.classification, Classification::Saturated);
        assert_eq!(f.severity, Fixed64::ZERO);
        assert_eq!(f.impact, 1);
    }

    #[test]
    fn short_supply_is_starved_on_ore() {
        let (graph, line) = smelter_line(Some(1.5), 2.0);
        let solution = solve_steady(&graph).unwrap();
        let findings = analyze(&solution, &graph);

        let f = finding(&findings, line.machine);
        assert_eq!(
            f.classification,
            Classification::Starved {
                limiting_item: item("iron_ore")
            }
        );
        assert_eq!(f.level, fixed(1.5));
        assert_eq!(f.severity, fixed(0.5));
    }

    #[test]
    fn output_bound_machine_is_balanced() {
        let mut graph = new_graph();
        let src = source(&mut graph, "iron_ore", None);
        let smelter = machine(&mut graph, "smelt_iron", 2.0);
        let out = sink(&mut graph, "iron_plate", Some(1.0));
        connect(&mut graph, src, smelter, "iron_ore");
        connect(&mut graph, smelter, out, "iron_plate");

        let solution = solve_steady(&graph).unwrap();
        let findings = analyze(&solution, &graph);
        assert_eq!(finding(&findings, smelter).classification, Classification::Balanced);
    }

    #[test]
    fn upstream_bottleneck_outranks_its_victims() {
        // ore 1.5/s -> smelter x2 -> gear maker x1 -> sink
        let mut graph = new_graph();
        let src = source(&mut graph, "iron_ore", Some(1.5));
        let smelter = machine(&mut graph, "smelt_iron", 2.0);
        let gears = machine(&mut graph, "make_gear", 1.0);
        let out = sink(&mut graph, "gear", None);
        connect(&mut graph, src, smelter, "iron_ore");
        connect(&mut graph, smelter, gears, "iron_plate");
        connect(&mut graph, gears, out, "gear");

        let solution = solve_steady(&graph).unwrap();
        let findings = analyze(&solution, &graph);

        assert_eq!(findings[0].node, smelter);
        assert_eq!(findings[0].impact, 2);
        assert_eq!(findings[0].severity, fixed(1.0));
        assert_eq!(findings[1].node, gears);
        assert_eq!(findings[1].impact, 1);
        assert_eq!(findings[1].severity, fixed(0.25));
        assert_eq!(
            findings[1].classification,
            Classification::Starved {
                limiting_item: item("iron_plate")
            }
        );
    }

    #[test]
    fn traversal_passes_through_merges_and_terminates_on_cycles() {
        let (graph, nodes) = recycling_loop();
        let solution = solve_steady(&graph).unwrap();
        let findings = analyze(&solution, &graph);

        assert_eq!(findings.len(), 2);
        // Each machine is starved and traces back to the other.
        assert_eq!(finding(&findings, nodes.refinery).impact, 2);
        assert_eq!(finding(&findings, nodes.reclaimer).impact, 2);
        for f in &findings {
            assert_close(f.severity, 2.0 / 3.0);
        }
    }

    #[test]
    fn summary_counts_classifications() {
        let mut graph = new_graph();
        let src = source(&mut graph, "iron_ore", Some(1.5));
        let starved = machine(&mut graph, "smelt_iron", 2.0);
        let plates = sink(&mut graph, "iron_plate", None);
        connect(&mut graph, src, starved, "iron_ore");
        connect(&mut graph, starved, plates, "iron_plate");
        let src2 = source(&mut graph, "copper_ore", None);
        let saturated = machine(&mut graph, "smelt_copper", 1.0);
        let copper = sink(&mut graph, "copper_plate", None);
        connect(&mut graph, src2, saturated, "copper_ore");
        connect(&mut graph, saturated, copper, "copper_plate");

        let solution = solve_steady(&graph).unwrap();
        let summary = summarize(&analyze(&solution, &graph));
        assert_eq!(summary.saturated, 1);
        assert_eq!(summary.starved, 1);
        assert_eq!(summary.balanced, 0);
        assert_eq!(summary.top.map(|f| f.node), Some(starved));
    }

    #[test]
    fn summary_of_healthy_graph_has_no_top() {
        let (graph, _) = smelter_line(None, 1.0);
        let solution = solve_steady(&graph).unwrap();
        assert_eq!(summarize(&analyze(&solution, &graph)).top, None);
    }

    #[test]
    fn item_balance_reports_deficit_and_surplus() {
        let (graph, _) = smelter_line(Some(1.5), 2.0);
        let solution = solve_steady(&graph).unwrap();
        let balance = item_balance(&solution, &graph);

        let ore = balance.iter().find(|b| b.item == item("iron_ore")).unwrap();
        assert_eq!(ore.produced, fixed(1.5));
        assert_eq!(ore.consumed, fixed(1.5));
        assert_eq!(ore.demand, fixed(2.0));
        assert_eq!(ore.deficit, fixed(0.5));
        assert_eq!(ore.surplus, Fixed64::ZERO);

        let plate = balance.iter().find(|b| b.item == item("iron_plate")).unwrap();
        assert_eq!(plate.produced, fixed(1.5));
        assert_eq!(plate.consumed, fixed(1.5));
    }

    #[test]
    fn unshipped_byproduct_shows_as_surplus() {
        let mut graph = new_graph();
        let src = source(&mut graph, "iron_ore", Some(2.0));
        let refinery = machine(&mut graph, "refine_iron", 1.0);
        let out = sink(&mut graph, "iron_plate", None);
        connect(&mut graph, src, refinery, "iron_ore");
        connect(&mut graph, refinery, out, "iron_plate");

        let solution = solve_steady(&graph).unwrap();
        let balance = item_balance(&solution, &graph);
        let slag = balance.iter().find(|b| b.item == item("slag")).unwrap();
        assert_eq!(slag.surplus, fixed(1.0));
    }
}

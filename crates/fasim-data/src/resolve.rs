//! Name resolution: turns data files into a sealed [`RecipeCatalog`], a
//! wired [`ProductionGraph`] and a [`DriverConfig`], and back.
//!
//! Loading runs in dependency order. Items are registered before the
//! recipes that name them, and a line resolves its recipe and item names
//! against an already sealed catalog. Any failure aborts the load and names
//! the offending file.

use crate::loader::{
    DataLoadError, check_duplicate, deserialize_file, require_data_file, resolve_name,
    serialize_file,
};
use crate::schema::{
    CatalogData, ItemData, LineData, LineEdgeData, LineNodeData, NodeKindData, RecipeEntryData,
};
use fasim_core::catalog::{CatalogBuilder, RecipeCatalog, RecipeDefinition, RecipeEntry};
use fasim_core::driver::DriverConfig;
use fasim_core::graph::{GraphError, NodeKind, ProductionGraph};
use fasim_core::id::{ItemKind, NodeId};
use fasim_core::rate::{Fixed64, fixed64_to_f64, try_f64_to_fixed64};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

// ===========================================================================
// Numbers
// ===========================================================================

fn to_fixed(value: f64, what: &str, file: &Path) -> Result<Fixed64, DataLoadError> {
    try_f64_to_fixed64(value).ok_or_else(|| DataLoadError::InvalidValue {
        file: file.to_path_buf(),
        detail: format!("{what} {value} is not representable"),
    })
}

fn to_fixed_opt(value: Option<f64>, what: &str, file: &Path) -> Result<Option<Fixed64>, DataLoadError> {
    value.map(|v| to_fixed(v, what, file)).transpose()
}

// ===========================================================================
// Catalog
// ===========================================================================

/// Build and seal a catalog from parsed data. `file` is used for error
/// reporting only.
pub fn catalog_from_data(data: &CatalogData, file: &Path) -> Result<RecipeCatalog, DataLoadError> {
    let mut builder = CatalogBuilder::new();
    let mut items: HashMap<String, ItemKind> = HashMap::new();

    for ItemData { name, description } in &data.items {
        check_duplicate(&items, name, file)?;
        let kind = match description {
            Some(text) => builder.register_item_with_description(name, text),
            None => builder.register_item(name),
        };
        items.insert(name.clone(), kind);
    }

    let mut recipes: HashMap<String, ()> = HashMap::new();
    for recipe in &data.recipes {
        check_duplicate(&recipes, &recipe.name, file)?;
        let entries = |side: &[RecipeEntryData]| -> Result<Vec<RecipeEntry>, DataLoadError> {
            side.iter()
                .map(|entry| {
                    let item = *resolve_name(&items, entry.item(), file, "item")?;
                    let quantity = to_fixed(entry.quantity(), "quantity", file)?;
                    Ok::<_, DataLoadError>(RecipeEntry::new(item, quantity))
                })
                .collect()
        };
        let mut def = RecipeDefinition::new(
            &recipe.name,
            entries(&recipe.inputs)?,
            entries(&recipe.outputs)?,
            to_fixed(recipe.duration, "duration", file)?,
        );
        if let Some(text) = &recipe.description {
            def = def.with_description(text);
        }
        builder
            .register(def)
            .map_err(|source| DataLoadError::Catalog {
                file: file.to_path_buf(),
                source,
            })?;
        recipes.insert(recipe.name.clone(), ());
    }

    Ok(builder.seal())
}

/// Load a catalog file (RON, JSON or TOML) and seal it.
pub fn load_catalog(path: &Path) -> Result<Arc<RecipeCatalog>, DataLoadError> {
    let data: CatalogData = deserialize_file(path)?;
    let catalog = catalog_from_data(&data, path)?;
    tracing::debug!(
        file = %path.display(),
        items = catalog.item_count(),
        recipes = catalog.recipe_count(),
        "catalog loaded"
    );
    Ok(Arc::new(catalog))
}

// ===========================================================================
// Production lines
// ===========================================================================

/// A graph built from a line file, with its node names.
#[derive(Debug)]
pub struct LoadedLine {
    pub graph: ProductionGraph,
    pub nodes: BTreeMap<String, NodeId>,
    pub description: Option<String>,
}

impl LoadedLine {
    /// Node id for a name from the line file.
    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.nodes.get(name).copied()
    }
}

/// Build a graph from parsed line data against `catalog`. Every node gets
/// its name as its label.
pub fn line_from_data(
    data: &LineData,
    catalog: &Arc<RecipeCatalog>,
    file: &Path,
) -> Result<LoadedLine, DataLoadError> {
    let item_names: HashMap<String, ItemKind> = catalog
        .items()
        .map(|(kind, def)| (def.name.clone(), kind))
        .collect();
    let recipe_names: HashMap<String, _> = catalog
        .recipes()
        .map(|(id, def)| (def.name.clone(), id))
        .collect();
    let graph_err = |source: GraphError| DataLoadError::Graph {
        file: file.to_path_buf(),
        source,
    };

    let mut graph = ProductionGraph::new(Arc::clone(catalog));
    let mut nodes: HashMap<String, NodeId> = HashMap::new();

    for LineNodeData { name, kind, buffers } in &data.nodes {
        check_duplicate(&nodes, name, file)?;
        let item = |item_name: &str| resolve_name(&item_names, item_name, file, "item").copied();
        let added = match kind {
            NodeKindData::Machine { recipe, multiplier } => {
                let recipe = *resolve_name(&recipe_names, recipe, file, "recipe")?;
                graph.add_node(recipe, to_fixed(*multiplier, "multiplier", file)?)
            }
            NodeKindData::Source { item: i, rate } => {
                graph.add_source(item(i.as_str())?, to_fixed_opt(*rate, "rate", file)?)
            }
            NodeKindData::Sink { item: i, rate } => {
                graph.add_sink(item(i.as_str())?, to_fixed_opt(*rate, "rate", file)?)
            }
            NodeKindData::Merge { item: i, inputs } => graph.add_merge(item(i.as_str())?, *inputs),
            NodeKindData::Split { item: i, outputs } => graph.add_split(item(i.as_str())?, *outputs),
        };
        let id = added.map_err(graph_err)?;
        graph.set_label(id, name).map_err(graph_err)?;
        for (item_name, capacity) in buffers {
            let capacity = to_fixed(*capacity, "buffer capacity", file)?;
            graph
                .set_buffer_capacity(id, item(item_name.as_str())?, capacity)
                .map_err(graph_err)?;
        }
        nodes.insert(name.clone(), id);
    }

    for LineEdgeData { from, to, item, capacity } in &data.edges {
        let from = *resolve_name(&nodes, from, file, "node")?;
        let to = *resolve_name(&nodes, to, file, "node")?;
        let kind = *resolve_name(&item_names, item, file, "item")?;
        let capacity = to_fixed_opt(*capacity, "edge capacity", file)?;
        graph
            .connect(from, kind, to, kind, capacity)
            .map_err(graph_err)?;
    }

    Ok(LoadedLine {
        graph,
        nodes: nodes.into_iter().collect(),
        description: data.description.clone(),
    })
}

/// Load a line file against `catalog`.
pub fn load_line(path: &Path, catalog: &Arc<RecipeCatalog>) -> Result<LoadedLine, DataLoadError> {
    let data: LineData = deserialize_file(path)?;
    let line = line_from_data(&data, catalog, path)?;
    tracing::debug!(
        file = %path.display(),
        line = %data.name,
        nodes = line.graph.node_count(),
        edges = line.graph.edge_count(),
        "production line loaded"
    );
    Ok(line)
}

/// Describe a graph as line data. Labels become node names; unlabeled or
/// clashing nodes get a generated name.
pub fn export_line(graph: &ProductionGraph, name: &str, description: Option<&str>) -> LineData {
    let catalog = graph.catalog();
    let mut names: HashMap<NodeId, String> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut nodes = Vec::with_capacity(graph.node_count());

    for (index, (id, data)) in graph.nodes().enumerate() {
        let kind = match data.kind {
            NodeKind::Machine { multiplier, .. } => NodeKindData::Machine {
                recipe: graph
                    .recipe_of(id)
                    .map(|r| r.name.clone())
                    .unwrap_or_default(),
                multiplier: fixed64_to_f64(multiplier),
            },
            NodeKind::Source { item, rate } => NodeKindData::Source {
                item: catalog.item_name(item).to_string(),
                rate: rate.map(fixed64_to_f64),
            },
            NodeKind::Sink { item, rate } => NodeKindData::Sink {
                item: catalog.item_name(item).to_string(),
                rate: rate.map(fixed64_to_f64),
            },
            NodeKind::Merge { item, inputs } => NodeKindData::Merge {
                item: catalog.item_name(item).to_string(),
                inputs,
            },
            NodeKind::Split { item, outputs } => NodeKindData::Split {
                item: catalog.item_name(item).to_string(),
                outputs,
            },
        };
        let node_name = match &data.label {
            Some(label) if !taken.contains(label) => label.clone(),
            _ => {
                let mut n = index;
                loop {
                    let candidate = format!("node_{n}");
                    if !taken.contains(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        taken.insert(node_name.clone());
        names.insert(id, node_name.clone());
        nodes.push(LineNodeData {
            name: node_name,
            kind,
            buffers: data
                .buffers
                .iter()
                .map(|(&item, &cap)| (catalog.item_name(item).to_string(), fixed64_to_f64(cap)))
                .collect(),
        });
    }

    let edges = graph
        .edges()
        .map(|(_, edge)| LineEdgeData {
            from: names[&edge.from].clone(),
            to: names[&edge.to].clone(),
            item: catalog.item_name(edge.item).to_string(),
            capacity: edge.capacity.map(fixed64_to_f64),
        })
        .collect();

    LineData {
        name: name.to_string(),
        description: description.map(str::to_string),
        nodes,
        edges,
    }
}

/// Write a graph as a line file, in the format the extension names.
pub fn save_line(
    path: &Path,
    graph: &ProductionGraph,
    name: &str,
    description: Option<&str>,
) -> Result<(), DataLoadError> {
    let data = export_line(graph, name, description);
    serialize_file(&data, path)?;
    tracing::debug!(file = %path.display(), nodes = data.nodes.len(), "production line saved");
    Ok(())
}

// ===========================================================================
// Driver configuration
// ===========================================================================

/// Load driver settings. Missing fields keep their defaults.
pub fn load_config(path: &Path) -> Result<DriverConfig, DataLoadError> {
    let config: DriverConfig = deserialize_file(path)?;
    if !(config.step_duration.is_finite() && config.step_duration > 0.0) {
        return Err(DataLoadError::InvalidValue {
            file: path.to_path_buf(),
            detail: format!("step_duration {} must be positive", config.step_duration),
        });
    }
    Ok(config)
}

// ===========================================================================
// Directory loading
// ===========================================================================

/// Everything a directory of data files describes.
#[derive(Debug)]
pub struct SimulationData {
    pub catalog: Arc<RecipeCatalog>,
    pub line: LoadedLine,
    pub config: DriverConfig,
}

/// Load `catalog.*` and `line.*` (required) and `config.*` (optional) from
/// `dir`. Each base name may exist in exactly one of RON, JSON or TOML.
pub fn load_directory(dir: &Path) -> Result<SimulationData, DataLoadError> {
    let catalog = load_catalog(&require_data_file(dir, "catalog")?)?;
    let line = load_line(&require_data_file(dir, "line")?, &catalog)?;
    let config = match crate::loader::find_data_file(dir, "config")? {
        Some(path) => load_config(&path)?,
        None => DriverConfig::default(),
    };
    tracing::info!(dir = %dir.display(), "simulation data loaded");
    Ok(SimulationData {
        catalog,
        line,
        config,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fasim_core::catalog::CatalogError;
    use fasim_core::solver::{BackpressurePolicy, solve_steady};
    use fasim_core::test_utils::{fixed, smelter_line, test_catalog};
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fasim_resolve_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    const CATALOG_RON: &str = r#"(
        items: [
            (name: "iron_ore", description: Some("Raw iron")),
            (name: "iron_plate"),
            (name: "gear"),
        ],
        recipes: [
            (name: "smelt_iron", inputs: [("iron_ore", 1)], outputs: [("iron_plate", 1)], duration: 1.0),
            (name: "make_gear", inputs: [("iron_plate", 2)], outputs: [("gear", 1)], duration: 0.5),
        ],
    )"#;

    const LINE_JSON: &str = r#"{
        "name": "gears",
        "nodes": [
            {"name": "ore", "kind": {"Source": {"item": "iron_ore", "rate": 1.5}}},
            {"name": "smelter", "kind": {"Machine": {"recipe": "smelt_iron", "multiplier": 2.0}},
             "buffers": {"iron_ore": 10.0}},
            {"name": "gears", "kind": {"Machine": {"recipe": "make_gear"}}},
            {"name": "out", "kind": {"Sink": {"item": "gear"}}}
        ],
        "edges": [
            {"from": "ore", "to": "smelter", "item": "iron_ore"},
            {"from": "smelter", "to": "gears", "item": "iron_plate", "capacity": 4.0},
            {"from": "gears", "to": "out", "item": "gear"}
        ]
    }"#;

    fn catalog_data() -> CatalogData {
        ron::from_str(CATALOG_RON).unwrap()
    }

    fn loaded_catalog() -> Arc<RecipeCatalog> {
        Arc::new(catalog_from_data(&catalog_data(), Path::new("catalog.ron")).unwrap())
    }

    // -----------------------------------------------------------------------
    // Test 1: Catalog names resolve to ids and rates
    // -----------------------------------------------------------------------

    #[test]
    fn catalog_resolves_names() {
        let catalog = loaded_catalog();
        assert_eq!(catalog.item_count(), 3);
        assert_eq!(catalog.recipe_count(), 2);

        let ore = catalog.item_id("iron_ore").unwrap();
        assert_eq!(
            catalog.item(ore).unwrap().description.as_deref(),
            Some("Raw iron")
        );
        let gear = catalog.lookup("make_gear").unwrap();
        let plate = catalog.item_id("iron_plate").unwrap();
        assert_eq!(gear.input_rate(plate), Some(fixed(4.0)));
    }

    // -----------------------------------------------------------------------
    // Test 2: Catalog errors name the problem
    // -----------------------------------------------------------------------

    #[test]
    fn catalog_rejects_bad_data() {
        let file = Path::new("catalog.ron");

        let mut data = catalog_data();
        data.items.push(ItemData {
            name: "gear".to_string(),
            description: None,
        });
        assert!(matches!(
            catalog_from_data(&data, file),
            Err(DataLoadError::DuplicateName { ref name, .. }) if name == "gear"
        ));

        let mut data = catalog_data();
        data.recipes[0].inputs = vec![RecipeEntryData::Short("coal".to_string(), 1.0)];
        assert!(matches!(
            catalog_from_data(&data, file),
            Err(DataLoadError::UnresolvedRef { expected_kind: "item", .. })
        ));

        let mut data = catalog_data();
        data.recipes[1].duration = 0.0;
        assert!(matches!(
            catalog_from_data(&data, file),
            Err(DataLoadError::Catalog {
                source: CatalogError::InvalidRecipeRate { .. },
                ..
            })
        ));

        let mut data = catalog_data();
        data.recipes[1].duration = f64::NAN;
        assert!(matches!(
            catalog_from_data(&data, file),
            Err(DataLoadError::InvalidValue { .. })
        ));

        let mut data = catalog_data();
        data.recipes.push(data.recipes[0].clone());
        assert!(matches!(
            catalog_from_data(&data, file),
            Err(DataLoadError::DuplicateName { ref name, .. }) if name == "smelt_iron"
        ));
    }

    // -----------------------------------------------------------------------
    // Test 3: A line wires the graph it describes
    // -----------------------------------------------------------------------

    #[test]
    fn line_builds_graph() {
        let catalog = loaded_catalog();
        let data: LineData = serde_json::from_str(LINE_JSON).unwrap();
        let line = line_from_data(&data, &catalog, Path::new("line.json")).unwrap();

        assert_eq!(line.graph.node_count(), 4);
        assert_eq!(line.graph.edge_count(), 3);
        let smelter = line.node("smelter").unwrap();
        assert_eq!(line.graph.find_by_label("smelter"), Some(smelter));
        let ore = catalog.item_id("iron_ore").unwrap();
        assert_eq!(
            line.graph.node(smelter).unwrap().buffers.get(&ore),
            Some(&fixed(10.0))
        );

        // 1.5 ore/s feeds the smelter; the gear maker takes 4 plates/s at full.
        let solution = solve_steady(&line.graph).unwrap();
        assert_eq!(solution.level(smelter), Some(fixed(1.5)));
        assert_eq!(solution.level(line.node("gears").unwrap()), Some(fixed(0.375)));
    }

    // -----------------------------------------------------------------------
    // Test 4: Line errors
    // -----------------------------------------------------------------------

    #[test]
    fn line_rejects_bad_references() {
        let catalog = loaded_catalog();
        let file = Path::new("line.json");
        let base: LineData = serde_json::from_str(LINE_JSON).unwrap();

        let mut data = base.clone();
        data.nodes[3].name = "gears".to_string();
        assert!(matches!(
            line_from_data(&data, &catalog, file),
            Err(DataLoadError::DuplicateName { .. })
        ));

        let mut data = base.clone();
        data.edges[0].to = "furnace".to_string();
        assert!(matches!(
            line_from_data(&data, &catalog, file),
            Err(DataLoadError::UnresolvedRef { expected_kind: "node", .. })
        ));

        let mut data = base.clone();
        data.nodes[1].kind = NodeKindData::Machine {
            recipe: "weld".to_string(),
            multiplier: 1.0,
        };
        assert!(matches!(
            line_from_data(&data, &catalog, file),
            Err(DataLoadError::UnresolvedRef { expected_kind: "recipe", .. })
        ));

        let mut data = base.clone();
        data.edges[2].item = "iron_plate".to_string();
        assert!(matches!(
            line_from_data(&data, &catalog, file),
            Err(DataLoadError::Graph {
                source: GraphError::TypeMismatch { .. },
                ..
            })
        ));

        let mut data = base;
        data.nodes[1].kind = NodeKindData::Machine {
            recipe: "smelt_iron".to_string(),
            multiplier: 0.0,
        };
        assert!(matches!(
            line_from_data(&data, &catalog, file),
            Err(DataLoadError::Graph {
                source: GraphError::InvalidMultiplier(_),
                ..
            })
        ));
    }

    // -----------------------------------------------------------------------
    // Test 5: Export then reload keeps the solution
    // -----------------------------------------------------------------------

    #[test]
    fn exported_line_reloads_in_every_format() {
        let dir = scratch_dir("export");
        let (mut graph, line) = smelter_line(Some(1.5), 2.0);
        graph.set_label(line.machine, "smelter").unwrap();
        let catalog = test_catalog();
        let expected = solve_steady(&graph).unwrap();

        for name in ["line.ron", "line.json", "line.toml"] {
            let path = dir.join(name);
            save_line(&path, &graph, "smelting", Some("Ore to plates")).unwrap();
            let loaded = load_line(&path, &catalog).unwrap();
            assert_eq!(loaded.description.as_deref(), Some("Ore to plates"), "{name}");
            assert_eq!(loaded.graph.node_count(), graph.node_count(), "{name}");
            assert_eq!(loaded.graph.edge_count(), graph.edge_count(), "{name}");

            let smelter = loaded.node("smelter").unwrap();
            let solution = solve_steady(&loaded.graph).unwrap();
            assert_eq!(solution.level(smelter), expected.level(line.machine), "{name}");
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn export_generates_unique_names() {
        let (mut graph, line) = smelter_line(None, 1.0);
        graph.set_label(line.source, "dup").unwrap();
        graph.set_label(line.machine, "dup").unwrap();
        let data = export_line(&graph, "dups", None);

        let names: HashSet<&str> = data.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names.len(), data.nodes.len());
        assert!(names.contains("dup"));
        assert_eq!(data.edges.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 6: Config files
    // -----------------------------------------------------------------------

    #[test]
    fn config_fields_default() {
        let dir = scratch_dir("config");
        let path = dir.join("config.toml");
        fs::write(
            &path,
            "step_duration = 0.5\nbackpressure = \"Throttle\"\n\n[solver]\nmax_iterations = 50\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.step_duration, 0.5);
        assert_eq!(config.backpressure, BackpressurePolicy::Throttle);
        assert_eq!(config.solver.max_iterations, 50);
        assert_eq!(config.history_capacity, DriverConfig::default().history_capacity);

        fs::write(&path, "step_duration = -1.0\n").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(DataLoadError::InvalidValue { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 7: Whole directory
    // -----------------------------------------------------------------------

    #[test]
    fn directory_loads_with_default_config() {
        let dir = scratch_dir("dir");
        fs::write(dir.join("catalog.ron"), CATALOG_RON).unwrap();
        fs::write(dir.join("line.json"), LINE_JSON).unwrap();

        let data = load_directory(&dir).unwrap();
        assert_eq!(data.catalog.recipe_count(), 2);
        assert_eq!(data.line.nodes.len(), 4);
        assert_eq!(data.config, DriverConfig::default());
        assert!(Arc::ptr_eq(data.line.graph.catalog(), &data.catalog));

        fs::remove_file(dir.join("line.json")).unwrap();
        assert!(matches!(
            load_directory(&dir),
            Err(DataLoadError::MissingRequired { ref file, .. }) if file == "line"
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}

//! Serde data file structs for catalogs and production lines.
//!
//! These structs define the on-disk format. Everything is referenced by
//! name; the loader resolves names into catalog ids and graph nodes. They
//! read from and write to RON, JSON, or TOML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ===========================================================================
// Catalog: items and recipes
// ===========================================================================

/// An item kind definition in a data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A recipe input or output entry, in short tuple form or full form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipeEntryData {
    /// Short form: `("item_name", quantity)`.
    Short(String, f64),
    /// Full form with named fields.
    Full { item: String, quantity: f64 },
}

impl RecipeEntryData {
    pub fn item(&self) -> &str {
        match self {
            RecipeEntryData::Short(item, _) | RecipeEntryData::Full { item, .. } => item,
        }
    }

    pub fn quantity(&self) -> f64 {
        match self {
            RecipeEntryData::Short(_, quantity) | RecipeEntryData::Full { quantity, .. } => {
                *quantity
            }
        }
    }
}

/// A recipe definition in a data file. `duration` is the cycle time in
/// seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<RecipeEntryData>,
    pub outputs: Vec<RecipeEntryData>,
    pub duration: f64,
}

/// A whole catalog file: items first, then recipes that use them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogData {
    #[serde(default)]
    pub items: Vec<ItemData>,
    #[serde(default)]
    pub recipes: Vec<RecipeData>,
}

// ===========================================================================
// Production lines
// ===========================================================================

fn default_multiplier() -> f64 {
    1.0
}

/// What a line node is. Rates are items per second; an absent rate is
/// unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKindData {
    Machine {
        recipe: String,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
    Source {
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
    },
    Sink {
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
    },
    Merge {
        item: String,
        inputs: u32,
    },
    Split {
        item: String,
        outputs: u32,
    },
}

/// A named node in a production line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineNodeData {
    pub name: String,
    pub kind: NodeKindData,
    /// Buffer capacity per item name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub buffers: BTreeMap<String, f64>,
}

/// An edge between two named nodes carrying one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEdgeData {
    pub from: String,
    pub to: String,
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
}

/// A production line: named nodes and the edges between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<LineNodeData>,
    #[serde(default)]
    pub edges: Vec<LineEdgeData>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // RON
    // -----------------------------------------------------------------------

    #[test]
    fn recipe_data_from_ron() {
        let ron = r#"
            (
                name: "smelt_iron",
                inputs: [("iron_ore", 1)],
                outputs: [(item: "iron_plate", quantity: 1.0)],
                duration: 3.2,
            )
        "#;
        let recipe: RecipeData = ron::from_str(ron).unwrap();
        assert_eq!(recipe.name, "smelt_iron");
        assert_eq!(recipe.inputs[0].item(), "iron_ore");
        assert!((recipe.inputs[0].quantity() - 1.0).abs() < f64::EPSILON);
        assert!(matches!(recipe.outputs[0], RecipeEntryData::Full { .. }));
        assert_eq!(recipe.outputs[0].item(), "iron_plate");
        assert!(recipe.description.is_none());
    }

    #[test]
    fn line_node_from_ron() {
        let ron = r#"
            (
                name: "smelter",
                kind: Machine(recipe: "smelt_iron"),
                buffers: {"iron_ore": 10.0},
            )
        "#;
        let node: LineNodeData = ron::from_str(ron).unwrap();
        assert_eq!(
            node.kind,
            NodeKindData::Machine {
                recipe: "smelt_iron".to_string(),
                multiplier: 1.0
            }
        );
        assert_eq!(node.buffers.get("iron_ore"), Some(&10.0));
    }

    // -----------------------------------------------------------------------
    // JSON
    // -----------------------------------------------------------------------

    #[test]
    fn line_data_from_json() {
        let json = r#"{
            "name": "iron",
            "nodes": [
                {"name": "ore", "kind": {"Source": {"item": "iron_ore", "rate": 1.5}}},
                {"name": "out", "kind": {"Sink": {"item": "iron_plate"}}}
            ],
            "edges": [{"from": "ore", "to": "out", "item": "iron_ore"}]
        }"#;
        let line: LineData = serde_json::from_str(json).unwrap();
        assert_eq!(line.nodes.len(), 2);
        assert_eq!(
            line.nodes[0].kind,
            NodeKindData::Source {
                item: "iron_ore".to_string(),
                rate: Some(1.5)
            }
        );
        assert_eq!(
            line.nodes[1].kind,
            NodeKindData::Sink {
                item: "iron_plate".to_string(),
                rate: None
            }
        );
        assert!(line.edges[0].capacity.is_none());
    }

    // -----------------------------------------------------------------------
    // TOML
    // -----------------------------------------------------------------------

    #[test]
    fn catalog_data_from_toml() {
        let toml_str = r#"
[[items]]
name = "iron_ore"
description = "Raw iron"

[[items]]
name = "iron_plate"

[[recipes]]
name = "smelt_iron"
inputs = [["iron_ore", 1]]
outputs = [{ item = "iron_plate", quantity = 1 }]
duration = 1.0
"#;
        let catalog: CatalogData = toml::from_str(toml_str).unwrap();
        assert_eq!(catalog.items.len(), 2);
        assert_eq!(catalog.items[0].description.as_deref(), Some("Raw iron"));
        assert_eq!(catalog.recipes[0].inputs[0].item(), "iron_ore");
        assert_eq!(catalog.recipes[0].outputs[0].item(), "iron_plate");
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let catalog: CatalogData = serde_json::from_str("{}").unwrap();
        assert_eq!(catalog, CatalogData::default());
    }
}

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a node (machine, source, sink, merge or split) in the
    /// production graph.
    pub struct NodeId;

    /// Identifies an edge (item flow between two slots) in the production graph.
    pub struct EdgeId;
}

/// Identifies an item kind in the catalog. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKind(pub u32);

/// Identifies a recipe in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipeId(pub u32);

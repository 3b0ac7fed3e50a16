//! Production graph: machine instances and the item flows between them.
//!
//! Every node exposes a fixed, enumerable list of input and output slots,
//! derived from its kind (a machine's slots follow its recipe entries). A
//! slot accepts exactly one edge. Fan-in and fan-out are modeled with
//! explicit [`NodeKind::Merge`] and [`NodeKind::Split`] nodes, so each node's
//! flow equations are well defined.
//!
//! Storage follows the slotmap pattern: nodes and edges live in `SlotMap`s,
//! per-node slot bindings in a `SecondaryMap` keyed by `NodeId`. Keys are
//! serialized as-is, so decoding a graph reproduces identical ids.

use crate::catalog::{RecipeCatalog, RecipeDefinition};
use crate::id::*;
use crate::rate::{Fixed64, Rate};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Which side of a node a slot is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotDirection {
    Input,
    Output,
}

impl fmt::Display for SlotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotDirection::Input => write!(f, "input"),
            SlotDirection::Output => write!(f, "output"),
        }
    }
}

/// Errors that can occur during graph construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("unknown recipe {0}")]
    UnknownRecipe(String),
    #[error("unknown item kind: {0:?}")]
    UnknownItem(ItemKind),
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("edge not found: {0:?}")]
    EdgeNotFound(EdgeId),
    #[error("type mismatch: {node:?} has no {direction} slot for {item:?}")]
    TypeMismatch {
        node: NodeId,
        item: ItemKind,
        direction: SlotDirection,
    },
    #[error("every {direction} slot for {item:?} on {node:?} is already bound")]
    SlotAlreadyBound {
        node: NodeId,
        item: ItemKind,
        direction: SlotDirection,
    },
    #[error("recipe '{0}' has a non-positive rate")]
    InvalidRecipeRate(String),
    #[error("multiplier must be positive, got {0}")]
    InvalidMultiplier(Fixed64),
    #[error("rate must be non-negative, got {0}")]
    InvalidRate(Fixed64),
    #[error("capacity must be non-negative, got {0}")]
    InvalidCapacity(Fixed64),
    #[error("merge/split nodes need at least one slot")]
    InvalidSlotCount,
}

// ---------------------------------------------------------------------------
// Core data structures
// ---------------------------------------------------------------------------

/// What a node does with the items that reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Runs `recipe` with `multiplier` parallel copies.
    Machine { recipe: RecipeId, multiplier: Fixed64 },
    /// External supply of one item. `None` means unbounded.
    Source { item: ItemKind, rate: Option<Rate> },
    /// External consumer of one item. `None` accepts any rate.
    Sink { item: ItemKind, rate: Option<Rate> },
    /// Combines `inputs` flows of one item into a single output.
    Merge { item: ItemKind, inputs: u32 },
    /// Distributes one flow of an item over `outputs` consumers.
    Split { item: ItemKind, outputs: u32 },
}

impl NodeKind {
    pub fn is_machine(&self) -> bool {
        matches!(self, NodeKind::Machine { .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self, NodeKind::Source { .. } | NodeKind::Sink { .. })
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, NodeKind::Merge { .. } | NodeKind::Split { .. })
    }
}

/// One input or output slot on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub item: ItemKind,
    pub edge: Option<EdgeId>,
}

/// Slot bindings for a single node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NodeSlots {
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
}

/// Per-node data stored in the production graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub kind: NodeKind,
    /// Optional display name; unique lookups go through `find_by_label`.
    #[serde(default)]
    pub label: Option<String>,
    /// Storage capacity per input item. Absent items have no storage.
    #[serde(default)]
    pub buffers: BTreeMap<ItemKind, Fixed64>,
}

/// Per-edge data stored in the production graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    pub from: NodeId,
    pub from_slot: u32,
    pub to: NodeId,
    pub to_slot: u32,
    pub item: ItemKind,
    /// Rate ceiling. `None` is unbounded.
    pub capacity: Option<Rate>,
}

/// Serializable part of the graph. The catalog is attached separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct GraphStore {
    nodes: SlotMap<NodeId, NodeData>,
    edges: SlotMap<EdgeId, EdgeData>,
    slots: SecondaryMap<NodeId, NodeSlots>,
    revision: u64,
}

impl GraphStore {
    /// Check a decoded store against `catalog`: every recipe and item must
    /// exist and every edge must be bound to the slots it names.
    pub(crate) fn check_against(&self, catalog: &RecipeCatalog) -> Result<(), GraphError> {
        let known = |item: ItemKind| {
            if catalog.item(item).is_some() {
                Ok(())
            } else {
                Err(GraphError::UnknownItem(item))
            }
        };

        for (id, data) in &self.nodes {
            match data.kind {
                NodeKind::Machine { recipe, .. } => {
                    if catalog.get(recipe).is_none() {
                        return Err(GraphError::UnknownRecipe(format!("{recipe:?}")));
                    }
                }
                NodeKind::Source { item, .. }
                | NodeKind::Sink { item, .. }
                | NodeKind::Merge { item, .. }
                | NodeKind::Split { item, .. } => known(item)?,
            }
            for &item in data.buffers.keys() {
                known(item)?;
            }
            if !self.slots.contains_key(id) {
                return Err(GraphError::NodeNotFound(id));
            }
        }

        for (id, edge) in &self.edges {
            known(edge.item)?;
            let out = self
                .slots
                .get(edge.from)
                .ok_or(GraphError::NodeNotFound(edge.from))?
                .outputs
                .get(edge.from_slot as usize);
            let inp = self
                .slots
                .get(edge.to)
                .ok_or(GraphError::NodeNotFound(edge.to))?
                .inputs
                .get(edge.to_slot as usize);
            let bound = |slot: Option<&Slot>| slot.is_some_and(|s| s.edge == Some(id) && s.item == edge.item);
            if !bound(out) || !bound(inp) {
                return Err(GraphError::EdgeNotFound(id));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProductionGraph
// ---------------------------------------------------------------------------

/// Machines, sources, sinks and routing nodes plus the edges between their
/// slots. Cycles are allowed.
#[derive(Debug, Clone)]
pub struct ProductionGraph {
    catalog: Arc<RecipeCatalog>,
    store: GraphStore,
}

impl ProductionGraph {
    /// Create a new, empty graph whose machines use recipes from `catalog`.
    pub fn new(catalog: Arc<RecipeCatalog>) -> Self {
        Self {
            catalog,
            store: GraphStore::default(),
        }
    }

    pub(crate) fn from_store(catalog: Arc<RecipeCatalog>, store: GraphStore) -> Self {
        Self { catalog, store }
    }

    pub(crate) fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<RecipeCatalog> {
        &self.catalog
    }

    /// Incremented by every structural change.
    pub fn revision(&self) -> u64 {
        self.store.revision
    }

    fn touch(&mut self) {
        self.store.revision += 1;
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Add a machine running `recipe` with `multiplier` parallel copies.
    pub fn add_node(&mut self, recipe: RecipeId, multiplier: Fixed64) -> Result<NodeId, GraphError> {
        let def = self
            .catalog
            .get(recipe)
            .ok_or_else(|| GraphError::UnknownRecipe(format!("#{}", recipe.0)))?;
        if !def.has_valid_rates() || def.outputs.is_empty() {
            return Err(GraphError::InvalidRecipeRate(def.name.clone()));
        }
        if multiplier <= Fixed64::ZERO {
            return Err(GraphError::InvalidMultiplier(multiplier));
        }
        let slots = NodeSlots {
            inputs: unbound(def.inputs.iter().map(|e| e.item)),
            outputs: unbound(def.outputs.iter().map(|e| e.item)),
        };
        Ok(self.insert(NodeKind::Machine { recipe, multiplier }, slots))
    }

    /// Add a machine by recipe name.
    pub fn add_node_by_name(&mut self, recipe: &str, multiplier: Fixed64) -> Result<NodeId, GraphError> {
        let id = self
            .catalog
            .recipe_id(recipe)
            .ok_or_else(|| GraphError::UnknownRecipe(recipe.to_string()))?;
        self.add_node(id, multiplier)
    }

    /// Add an external source of `item`. `None` means unbounded supply.
    pub fn add_source(&mut self, item: ItemKind, rate: Option<Rate>) -> Result<NodeId, GraphError> {
        self.check_item(item)?;
        check_rate(rate)?;
        let slots = NodeSlots {
            inputs: Vec::new(),
            outputs: unbound([item]),
        };
        Ok(self.insert(NodeKind::Source { item, rate }, slots))
    }

    /// Add an external sink for `item`. `rate` caps consumption.
    pub fn add_sink(&mut self, item: ItemKind, rate: Option<Rate>) -> Result<NodeId, GraphError> {
        self.check_item(item)?;
        check_rate(rate)?;
        let slots = NodeSlots {
            inputs: unbound([item]),
            outputs: Vec::new(),
        };
        Ok(self.insert(NodeKind::Sink { item, rate }, slots))
    }

    /// Add a merge node with `inputs` input slots for `item`.
    pub fn add_merge(&mut self, item: ItemKind, inputs: u32) -> Result<NodeId, GraphError> {
        self.check_item(item)?;
        if inputs == 0 {
            return Err(GraphError::InvalidSlotCount);
        }
        let slots = NodeSlots {
            inputs: unbound(std::iter::repeat_n(item, inputs as usize)),
            outputs: unbound([item]),
        };
        Ok(self.insert(NodeKind::Merge { item, inputs }, slots))
    }

    /// Add a split node with `outputs` output slots for `item`.
    pub fn add_split(&mut self, item: ItemKind, outputs: u32) -> Result<NodeId, GraphError> {
        self.check_item(item)?;
        if outputs == 0 {
            return Err(GraphError::InvalidSlotCount);
        }
        let slots = NodeSlots {
            inputs: unbound([item]),
            outputs: unbound(std::iter::repeat_n(item, outputs as usize)),
        };
        Ok(self.insert(NodeKind::Split { item, outputs }, slots))
    }

    fn insert(&mut self, kind: NodeKind, slots: NodeSlots) -> NodeId {
        let id = self.store.nodes.insert(NodeData {
            kind,
            label: None,
            buffers: BTreeMap::new(),
        });
        self.store.slots.insert(id, slots);
        self.touch();
        id
    }

    fn check_item(&self, item: ItemKind) -> Result<(), GraphError> {
        if self.catalog.item(item).is_none() {
            return Err(GraphError::UnknownItem(item));
        }
        Ok(())
    }

    /// Remove a node and every edge attached to it.
    pub fn remove_node(&mut self, node: NodeId) -> Result<NodeData, GraphError> {
        let slots = self
            .store
            .slots
            .get(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        let attached: Vec<EdgeId> = slots
            .inputs
            .iter()
            .chain(slots.outputs.iter())
            .filter_map(|s| s.edge)
            .collect();
        for edge in attached {
            self.disconnect(edge)?;
        }
        self.store.slots.remove(node);
        let data = self
            .store
            .nodes
            .remove(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        self.touch();
        Ok(data)
    }

    pub fn set_label(&mut self, node: NodeId, label: &str) -> Result<(), GraphError> {
        let data = self
            .store
            .nodes
            .get_mut(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        data.label = Some(label.to_string());
        Ok(())
    }

    /// First node (in id order) carrying `label`.
    pub fn find_by_label(&self, label: &str) -> Option<NodeId> {
        self.store
            .nodes
            .iter()
            .find(|(_, d)| d.label.as_deref() == Some(label))
            .map(|(id, _)| id)
    }

    /// Declare storage for an input item of a machine, or for a sink's item.
    pub fn set_buffer_capacity(
        &mut self,
        node: NodeId,
        item: ItemKind,
        capacity: Fixed64,
    ) -> Result<(), GraphError> {
        if capacity < Fixed64::ZERO {
            return Err(GraphError::InvalidCapacity(capacity));
        }
        let data = self
            .store
            .nodes
            .get(node)
            .ok_or(GraphError::NodeNotFound(node))?;
        let consumes = match &data.kind {
            NodeKind::Machine { .. } => self
                .input_slots(node)
                .iter()
                .any(|slot| slot.item == item),
            NodeKind::Sink { item: sink_item, .. } => *sink_item == item,
            _ => false,
        };
        if !consumes {
            return Err(GraphError::TypeMismatch {
                node,
                item,
                direction: SlotDirection::Input,
            });
        }
        if let Some(data) = self.store.nodes.get_mut(node) {
            data.buffers.insert(item, capacity);
        }
        self.touch();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------

    /// Connect an output slot of `from` to an input slot of `to`.
    ///
    /// The item must be produced by `from` and consumed by `to`. Merge
    /// inputs and split outputs bind the lowest free slot.
    pub fn connect(
        &mut self,
        from: NodeId,
        output_item: ItemKind,
        to: NodeId,
        input_item: ItemKind,
        capacity: Option<Rate>,
    ) -> Result<EdgeId, GraphError> {
        if !self.store.nodes.contains_key(from) {
            return Err(GraphError::NodeNotFound(from));
        }
        if !self.store.nodes.contains_key(to) {
            return Err(GraphError::NodeNotFound(to));
        }
        check_capacity(capacity)?;
        if input_item != output_item {
            return Err(GraphError::TypeMismatch {
                node: to,
                item: output_item,
                direction: SlotDirection::Input,
            });
        }
        let from_slot = self.free_slot(from, output_item, SlotDirection::Output)?;
        let to_slot = self.free_slot(to, input_item, SlotDirection::Input)?;

        let edge = self.store.edges.insert(EdgeData {
            from,
            from_slot: from_slot as u32,
            to,
            to_slot: to_slot as u32,
            item: output_item,
            capacity,
        });
        if let Some(slots) = self.store.slots.get_mut(from) {
            slots.outputs[from_slot].edge = Some(edge);
        }
        if let Some(slots) = self.store.slots.get_mut(to) {
            slots.inputs[to_slot].edge = Some(edge);
        }
        self.touch();
        Ok(edge)
    }

    /// Index of the lowest unbound slot for `item`, or the matching error.
    fn free_slot(
        &self,
        node: NodeId,
        item: ItemKind,
        direction: SlotDirection,
    ) -> Result<usize, GraphError> {
        let slots = match direction {
            SlotDirection::Input => self.input_slots(node),
            SlotDirection::Output => self.output_slots(node),
        };
        let mut seen = false;
        for (index, slot) in slots.iter().enumerate() {
            if slot.item != item {
                continue;
            }
            seen = true;
            if slot.edge.is_none() {
                return Ok(index);
            }
        }
        if seen {
            Err(GraphError::SlotAlreadyBound {
                node,
                item,
                direction,
            })
        } else {
            Err(GraphError::TypeMismatch {
                node,
                item,
                direction,
            })
        }
    }

    /// Remove an edge, freeing both slots.
    pub fn disconnect(&mut self, edge: EdgeId) -> Result<EdgeData, GraphError> {
        let data = self
            .store
            .edges
            .remove(edge)
            .ok_or(GraphError::EdgeNotFound(edge))?;
        if let Some(slot) = self
            .store
            .slots
            .get_mut(data.from)
            .and_then(|s| s.outputs.get_mut(data.from_slot as usize))
        {
            slot.edge = None;
        }
        if let Some(slot) = self
            .store
            .slots
            .get_mut(data.to)
            .and_then(|s| s.inputs.get_mut(data.to_slot as usize))
        {
            slot.edge = None;
        }
        self.touch();
        Ok(data)
    }

    /// Change an edge's rate ceiling.
    pub fn set_edge_capacity(&mut self, edge: EdgeId, capacity: Option<Rate>) -> Result<(), GraphError> {
        check_capacity(capacity)?;
        let data = self
            .store
            .edges
            .get_mut(edge)
            .ok_or(GraphError::EdgeNotFound(edge))?;
        data.capacity = capacity;
        self.touch();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, node: NodeId) -> Option<&NodeData> {
        self.store.nodes.get(node)
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&EdgeData> {
        self.store.edges.get(edge)
    }

    /// Recipe of a machine node.
    pub fn recipe_of(&self, node: NodeId) -> Option<&RecipeDefinition> {
        match self.node(node)?.kind {
            NodeKind::Machine { recipe, .. } => self.catalog.get(recipe),
            _ => None,
        }
    }

    pub fn input_slots(&self, node: NodeId) -> &[Slot] {
        self.store
            .slots
            .get(node)
            .map(|s| s.inputs.as_slice())
            .unwrap_or(&[])
    }

    pub fn output_slots(&self, node: NodeId) -> &[Slot] {
        self.store
            .slots
            .get(node)
            .map(|s| s.outputs.as_slice())
            .unwrap_or(&[])
    }

    /// Edges feeding a node, in slot order.
    pub fn input_edges(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.input_slots(node).iter().filter_map(|s| s.edge)
    }

    /// Edges leaving a node, in slot order.
    pub fn output_edges(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.output_slots(node).iter().filter_map(|s| s.edge)
    }

    pub fn node_count(&self) -> usize {
        self.store.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.store.edges.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.store.nodes.contains_key(node)
    }

    pub fn contains_edge(&self, edge: EdgeId) -> bool {
        self.store.edges.contains_key(edge)
    }

    /// Iterate over all nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.store.nodes.iter()
    }

    /// Iterate over all edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &EdgeData)> {
        self.store.edges.iter()
    }

    /// Weakly connected components, each sorted by `NodeId`, ordered by
    /// their smallest member.
    pub fn components(&self) -> Vec<Vec<NodeId>> {
        let index: SecondaryMap<NodeId, usize> = self
            .store
            .nodes
            .keys()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        let ids: Vec<NodeId> = self.store.nodes.keys().collect();
        let mut parent: Vec<usize> = (0..ids.len()).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for (_, edge) in &self.store.edges {
            if let (Some(&a), Some(&b)) = (index.get(edge.from), index.get(edge.to)) {
                let ra = find(&mut parent, a);
                let rb = find(&mut parent, b);
                if ra != rb {
                    // Keep the smaller index as root so component order is stable.
                    let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
                    parent[hi] = lo;
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        for (i, &id) in ids.iter().enumerate() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(id);
        }
        groups.into_values().collect()
    }
}

fn unbound(items: impl IntoIterator<Item = ItemKind>) -> Vec<Slot> {
    items
        .into_iter()
        .map(|item| Slot { item, edge: None })
        .collect()
}

fn check_capacity(capacity: Option<Rate>) -> Result<(), GraphError> {
    match capacity {
        Some(c) if c < Fixed64::ZERO => Err(GraphError::InvalidCapacity(c)),
        _ => Ok(()),
    }
}

fn check_rate(rate: Option<Rate>) -> Result<(), GraphError> {
    match rate {
        Some(r) if r < Fixed64::ZERO => Err(GraphError::InvalidRate(r)),
        _ => Ok(()),
    }
}

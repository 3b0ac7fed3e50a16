//! Recipe catalog: item kinds and recipe definitions.
//!
//! Two-phase lifecycle. A [`CatalogBuilder`] accepts registrations; calling
//! [`CatalogBuilder::seal`] consumes it and yields an immutable
//! [`RecipeCatalog`] that is shared by `Arc` between graphs, solver workers
//! and readers. There is no way back from a sealed catalog to a builder.

use crate::id::{ItemKind, RecipeId};
use crate::rate::{Fixed64, Rate, div_rate};
use std::collections::HashMap;

/// An item kind definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDef {
    pub name: String,
    pub description: Option<String>,
}

/// A recipe input/output entry: `quantity` items per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipeEntry {
    pub item: ItemKind,
    pub quantity: Fixed64,
}

impl RecipeEntry {
    pub fn new(item: ItemKind, quantity: Fixed64) -> Self {
        Self { item, quantity }
    }
}

/// A recipe: fixed input quantities turn into fixed output quantities once
/// per cycle of `duration` seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeDefinition {
    /// Unique identifier within a catalog.
    pub name: String,
    pub description: Option<String>,
    pub inputs: Vec<RecipeEntry>,
    pub outputs: Vec<RecipeEntry>,
    /// Base cycle duration in seconds.
    pub duration: Fixed64,
}

impl RecipeDefinition {
    pub fn new(
        name: &str,
        inputs: Vec<RecipeEntry>,
        outputs: Vec<RecipeEntry>,
        duration: Fixed64,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            inputs,
            outputs,
            duration,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Items per second for one copy of this recipe.
    pub fn rate(&self, entry: &RecipeEntry) -> Rate {
        div_rate(entry.quantity, self.duration)
    }

    pub fn input_rate(&self, item: ItemKind) -> Option<Rate> {
        self.inputs
            .iter()
            .find(|e| e.item == item)
            .map(|e| self.rate(e))
    }

    pub fn output_rate(&self, item: ItemKind) -> Option<Rate> {
        self.outputs
            .iter()
            .find(|e| e.item == item)
            .map(|e| self.rate(e))
    }

    /// `(item, items per second)` for each input, in declaration order.
    pub fn input_rates(&self) -> impl Iterator<Item = (ItemKind, Rate)> + '_ {
        self.inputs.iter().map(|e| (e.item, self.rate(e)))
    }

    /// `(item, items per second)` for each output, in declaration order.
    pub fn output_rates(&self) -> impl Iterator<Item = (ItemKind, Rate)> + '_ {
        self.outputs.iter().map(|e| (e.item, self.rate(e)))
    }

    /// Returns true if every quantity and the duration are strictly positive.
    /// A zero rate would let a machine run without its input, which breaks
    /// the solver's monotonicity.
    pub fn has_valid_rates(&self) -> bool {
        self.duration > Fixed64::ZERO
            && self
                .inputs
                .iter()
                .chain(self.outputs.iter())
                .all(|e| e.quantity > Fixed64::ZERO)
    }

    fn check(&self, item_count: usize) -> Result<(), CatalogError> {
        if self.outputs.is_empty() {
            return Err(CatalogError::EmptyOutputs(self.name.clone()));
        }
        if self.duration <= Fixed64::ZERO {
            return Err(CatalogError::InvalidRecipeRate {
                recipe: self.name.clone(),
                detail: "cycle duration must be positive",
            });
        }
        if !self.has_valid_rates() {
            return Err(CatalogError::InvalidRecipeRate {
                recipe: self.name.clone(),
                detail: "quantities must be positive",
            });
        }
        for side in [&self.inputs, &self.outputs] {
            for (i, entry) in side.iter().enumerate() {
                if entry.item.0 as usize >= item_count {
                    return Err(CatalogError::UnknownItem(entry.item));
                }
                if side[..i].iter().any(|e| e.item == entry.item) {
                    return Err(CatalogError::DuplicateItem {
                        recipe: self.name.clone(),
                        item: entry.item,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("recipe '{0}' is already registered")]
    DuplicateRecipe(String),
    #[error("unknown recipe '{0}'")]
    UnknownRecipe(String),
    #[error("unknown item kind: {0:?}")]
    UnknownItem(ItemKind),
    #[error("invalid rate in recipe '{recipe}': {detail}")]
    InvalidRecipeRate { recipe: String, detail: &'static str },
    #[error("recipe '{0}' has no outputs")]
    EmptyOutputs(String),
    #[error("recipe '{recipe}' lists {item:?} twice on the same side")]
    DuplicateItem { recipe: String, item: ItemKind },
}

/// Mutable catalog under construction.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    items: Vec<ItemDef>,
    item_name_to_id: HashMap<String, ItemKind>,
    recipes: Vec<RecipeDefinition>,
    recipe_name_to_id: HashMap<String, RecipeId>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an item kind by name. Registering the same name twice
    /// returns the existing kind.
    pub fn register_item(&mut self, name: &str) -> ItemKind {
        if let Some(&id) = self.item_name_to_id.get(name) {
            return id;
        }
        let id = ItemKind(self.items.len() as u32);
        self.items.push(ItemDef {
            name: name.to_string(),
            description: None,
        });
        self.item_name_to_id.insert(name.to_string(), id);
        id
    }

    /// Register an item kind with a description. An existing item keeps its
    /// kind and gets the new description.
    pub fn register_item_with_description(&mut self, name: &str, description: &str) -> ItemKind {
        let id = self.register_item(name);
        self.items[id.0 as usize].description = Some(description.to_string());
        id
    }

    /// Register a recipe. Fails if the name is taken or the definition is
    /// malformed; the builder is unchanged on failure.
    pub fn register(&mut self, recipe: RecipeDefinition) -> Result<RecipeId, CatalogError> {
        if self.recipe_name_to_id.contains_key(&recipe.name) {
            return Err(CatalogError::DuplicateRecipe(recipe.name));
        }
        recipe.check(self.items.len())?;
        let id = RecipeId(self.recipes.len() as u32);
        self.recipe_name_to_id.insert(recipe.name.clone(), id);
        self.recipes.push(recipe);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Result<&RecipeDefinition, CatalogError> {
        self.recipe_name_to_id
            .get(name)
            .map(|id| &self.recipes[id.0 as usize])
            .ok_or_else(|| CatalogError::UnknownRecipe(name.to_string()))
    }

    pub fn item_id(&self, name: &str) -> Option<ItemKind> {
        self.item_name_to_id.get(name).copied()
    }

    pub fn recipe_id(&self, name: &str) -> Option<RecipeId> {
        self.recipe_name_to_id.get(name).copied()
    }

    /// Freeze the catalog. No further registration is possible.
    pub fn seal(self) -> RecipeCatalog {
        tracing::debug!(
            items = self.items.len(),
            recipes = self.recipes.len(),
            "recipe catalog sealed"
        );
        RecipeCatalog {
            items: self.items,
            item_name_to_id: self.item_name_to_id,
            recipes: self.recipes,
            recipe_name_to_id: self.recipe_name_to_id,
        }
    }
}

/// Immutable catalog. Frozen by [`CatalogBuilder::seal`]; safe to share
/// between threads.
#[derive(Debug)]
pub struct RecipeCatalog {
    items: Vec<ItemDef>,
    item_name_to_id: HashMap<String, ItemKind>,
    recipes: Vec<RecipeDefinition>,
    recipe_name_to_id: HashMap<String, RecipeId>,
}

impl RecipeCatalog {
    pub fn lookup(&self, name: &str) -> Result<&RecipeDefinition, CatalogError> {
        self.recipe_name_to_id
            .get(name)
            .map(|id| &self.recipes[id.0 as usize])
            .ok_or_else(|| CatalogError::UnknownRecipe(name.to_string()))
    }

    pub fn get(&self, id: RecipeId) -> Option<&RecipeDefinition> {
        self.recipes.get(id.0 as usize)
    }

    pub fn recipe_id(&self, name: &str) -> Option<RecipeId> {
        self.recipe_name_to_id.get(name).copied()
    }

    pub fn item(&self, kind: ItemKind) -> Option<&ItemDef> {
        self.items.get(kind.0 as usize)
    }

    pub fn item_id(&self, name: &str) -> Option<ItemKind> {
        self.item_name_to_id.get(name).copied()
    }

    /// Item name for display, or `"?"` for an unknown kind.
    pub fn item_name(&self, kind: ItemKind) -> &str {
        self.item(kind).map(|d| d.name.as_str()).unwrap_or("?")
    }

    pub fn recipes(&self) -> impl Iterator<Item = (RecipeId, &RecipeDefinition)> {
        self.recipes
            .iter()
            .enumerate()
            .map(|(i, r)| (RecipeId(i as u32), r))
    }

    pub fn items(&self) -> impl Iterator<Item = (ItemKind, &ItemDef)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, d)| (ItemKind(i as u32), d))
    }

    pub fn recipe_count(&self) -> usize {
        self.recipes.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

//! Recipe catalog - read-only index over static item, recipe and building data
//!
//! Loaded once at process start from three JSON collections:
//!
//! ```text
//! <catalog_dir>/
//! ├── item_desc.json             # [{ id, name, tier, description, icon_asset_name }]
//! ├── crafting_recipe_desc.json  # [{ id, name, crafted_item_stacks, consumed_item_stacks, building_requirement }]
//! └── building_type_desc.json    # [{ id, name }]
//! ```
//!
//! Stacks are arrays whose first two elements are `[item_id, quantity]`.
//! The recipe graph is not guaranteed to be acyclic; the expander handles
//! that, the catalog only indexes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::TrackerError;

pub const ITEMS_FILE: &str = "item_desc.json";
pub const RECIPES_FILE: &str = "crafting_recipe_desc.json";
pub const BUILDINGS_FILE: &str = "building_type_desc.json";

/// Maximum number of suggestions returned by [`RecipeCatalog::suggest`]
pub const MAX_SUGGESTIONS: usize = 25;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogItem {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_asset_name: String,
}

fn default_tier() -> i32 {
    -1
}

/// `(item, quantity)` pair inside a recipe
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ItemStack {
    pub item_id: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BuildingRequirement {
    pub building_type: i64,
    pub tier: Option<i32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Recipe {
    pub id: i64,
    pub name: String,
    pub crafted_item_stacks: Vec<ItemStack>,
    pub consumed_item_stacks: Vec<ItemStack>,
    pub building_requirement: Option<BuildingRequirement>,
}

impl Recipe {
    /// Quantity of `item_id` produced by one craft (1 when unspecified)
    pub fn output_quantity(&self, item_id: i64) -> i64 {
        self.crafted_item_stacks
            .iter()
            .find(|s| s.item_id == item_id)
            .map(|s| s.quantity)
            .filter(|q| *q > 0)
            .unwrap_or(1)
    }
}

/// Recipe with item ids resolved to names, for display
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CraftInfo {
    pub recipe_id: i64,
    pub name: String,
    pub produces: Vec<NamedStack>,
    pub ingredients: Vec<NamedStack>,
    pub station: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NamedStack {
    pub item: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildingType {
    pub id: i64,
    pub name: String,
}

/// Recipe as it appears on disk
#[derive(Debug, Deserialize)]
struct RawRecipe {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    crafted_item_stacks: Vec<Value>,
    #[serde(default)]
    consumed_item_stacks: Vec<Value>,
    #[serde(default)]
    building_requirement: Value,
}

fn parse_stack(value: &Value) -> Option<ItemStack> {
    let parts = value.as_array()?;
    Some(ItemStack {
        item_id: parts.first()?.as_i64()?,
        quantity: parts.get(1)?.as_i64()?,
    })
}

fn parse_requirement(value: &Value) -> Option<BuildingRequirement> {
    let body = match value {
        Value::Array(parts) => parts.get(1)?,
        Value::Object(_) => value,
        _ => return None,
    };
    Some(BuildingRequirement {
        building_type: body.get("building_type")?.as_i64()?,
        tier: body
            .get("tier")
            .and_then(Value::as_i64)
            .and_then(|t| i32::try_from(t).ok()),
    })
}

impl From<RawRecipe> for Recipe {
    fn from(raw: RawRecipe) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            crafted_item_stacks: raw.crafted_item_stacks.iter().filter_map(parse_stack).collect(),
            consumed_item_stacks: raw.consumed_item_stacks.iter().filter_map(parse_stack).collect(),
            building_requirement: parse_requirement(&raw.building_requirement),
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// In-memory index over the static catalog
#[derive(Debug, Default)]
pub struct RecipeCatalog {
    items: Vec<CatalogItem>,
    recipes: Vec<Recipe>,
    buildings: Vec<BuildingType>,
    item_by_id: HashMap<i64, usize>,
    items_by_name: HashMap<String, Vec<usize>>,
    recipe_by_output: HashMap<i64, usize>,
    building_by_id: HashMap<i64, usize>,
    building_by_name: HashMap<String, usize>,
}

impl RecipeCatalog {
    /// Load the three collections from `dir`
    ///
    /// A missing file yields an empty collection; malformed JSON is an error.
    pub fn load(dir: &Path) -> Result<Self, TrackerError> {
        let items: Vec<CatalogItem> = read_collection(&dir.join(ITEMS_FILE))?;
        let raw_recipes: Vec<RawRecipe> = read_collection(&dir.join(RECIPES_FILE))?;
        let buildings: Vec<BuildingType> = read_collection(&dir.join(BUILDINGS_FILE))?;

        let catalog = Self::from_parts(
            items,
            raw_recipes.into_iter().map(Recipe::from).collect(),
            buildings,
        );

        info!(
            dir = %dir.display(),
            items = catalog.items.len(),
            recipes = catalog.recipes.len(),
            buildings = catalog.buildings.len(),
            "Loaded recipe catalog"
        );

        Ok(catalog)
    }

    /// Build the indexes over already-parsed collections
    pub fn from_parts(
        items: Vec<CatalogItem>,
        recipes: Vec<Recipe>,
        buildings: Vec<BuildingType>,
    ) -> Self {
        let mut item_by_id = HashMap::with_capacity(items.len());
        let mut items_by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, item) in items.iter().enumerate() {
            item_by_id.entry(item.id).or_insert(idx);
            items_by_name
                .entry(item.name.to_lowercase())
                .or_default()
                .push(idx);
        }

        // First recipe in load order wins for each output item
        let mut recipe_by_output = HashMap::new();
        for (idx, recipe) in recipes.iter().enumerate() {
            for stack in &recipe.crafted_item_stacks {
                recipe_by_output.entry(stack.item_id).or_insert(idx);
            }
        }

        let mut building_by_id = HashMap::with_capacity(buildings.len());
        let mut building_by_name = HashMap::with_capacity(buildings.len());
        for (idx, building) in buildings.iter().enumerate() {
            building_by_id.entry(building.id).or_insert(idx);
            building_by_name
                .entry(building.name.to_lowercase())
                .or_insert(idx);
        }

        Self {
            items,
            recipes,
            buildings,
            item_by_id,
            items_by_name,
            recipe_by_output,
            building_by_id,
            building_by_name,
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn recipe_count(&self) -> usize {
        self.recipes.len()
    }

    pub fn item(&self, id: i64) -> Option<&CatalogItem> {
        self.item_by_id.get(&id).map(|idx| &self.items[*idx])
    }

    pub fn building(&self, id: i64) -> Option<&BuildingType> {
        self.building_by_id.get(&id).map(|idx| &self.buildings[*idx])
    }

    /// Resolve an item by case-insensitive exact name
    ///
    /// Among items sharing a name, the first one with a producing recipe is
    /// preferred, then the first loaded.
    pub fn resolve_item(&self, name: &str) -> Option<&CatalogItem> {
        let candidates = self.items_by_name.get(&name.trim().to_lowercase())?;
        let chosen = candidates
            .iter()
            .find(|idx| self.recipe_by_output.contains_key(&self.items[**idx].id))
            .or_else(|| candidates.first())?;
        Some(&self.items[*chosen])
    }

    /// Resolve a building type by case-insensitive exact name
    pub fn resolve_building(&self, name: &str) -> Option<&BuildingType> {
        self.building_by_name
            .get(&name.trim().to_lowercase())
            .map(|idx| &self.buildings[*idx])
    }

    /// The recipe producing `item_id`, if any
    pub fn recipe_for(&self, item_id: i64) -> Option<&Recipe> {
        self.recipe_by_output.get(&item_id).map(|idx| &self.recipes[*idx])
    }

    /// Find items by numeric id, exact name, or name fragment (in that order)
    pub fn find_items(&self, query: &str) -> Vec<&CatalogItem> {
        let query = query.trim();
        if let Ok(id) = query.parse::<i64>() {
            if let Some(item) = self.item(id) {
                return vec![item];
            }
        }

        let lower = query.to_lowercase();
        if let Some(indices) = self.items_by_name.get(&lower) {
            return indices.iter().map(|idx| &self.items[*idx]).collect();
        }

        self.items
            .iter()
            .filter(|item| item.name.to_lowercase().contains(&lower))
            .collect()
    }

    /// All recipes whose outputs include any of `item_ids`, in load order
    pub fn recipes_producing(&self, item_ids: &[i64]) -> Vec<&Recipe> {
        self.recipes
            .iter()
            .filter(|r| r.crafted_item_stacks.iter().any(|s| item_ids.contains(&s.item_id)))
            .collect()
    }

    /// Display name for an item id, falling back to the raw id
    pub fn item_name(&self, id: i64) -> String {
        self.item(id)
            .map(|item| item.name.clone())
            .unwrap_or_else(|| format!("Unknown Item (ID: {})", id))
    }

    /// Crafting station label, e.g. "Carpentry Station (Tier 2)" or "Any"
    pub fn station_name(&self, recipe: &Recipe) -> String {
        match recipe.building_requirement {
            Some(req) => {
                let name = self
                    .building(req.building_type)
                    .map(|b| b.name.clone())
                    .unwrap_or_else(|| format!("Building Type {}", req.building_type));
                match req.tier {
                    Some(tier) => format!("{} (Tier {})", name, tier),
                    None => name,
                }
            }
            None => "Any".to_string(),
        }
    }

    /// Recipes producing the items matched by `query` (see [`Self::find_items`])
    pub fn craft_lookup(&self, query: &str) -> Vec<CraftInfo> {
        let ids: Vec<i64> = self.find_items(query).iter().map(|item| item.id).collect();
        let named = |stacks: &[ItemStack]| -> Vec<NamedStack> {
            stacks
                .iter()
                .map(|s| NamedStack {
                    item: self.item_name(s.item_id),
                    quantity: s.quantity,
                })
                .collect()
        };

        self.recipes_producing(&ids)
            .into_iter()
            .map(|recipe| CraftInfo {
                recipe_id: recipe.id,
                name: recipe.name.clone(),
                produces: named(&recipe.crafted_item_stacks),
                ingredients: named(&recipe.consumed_item_stacks),
                station: self.station_name(recipe),
            })
            .collect()
    }

    /// Building and item names containing `fragment`, buildings first
    pub fn suggest(&self, fragment: &str) -> Vec<&str> {
        let lower = fragment.trim().to_lowercase();
        self.buildings
            .iter()
            .map(|b| b.name.as_str())
            .chain(self.items.iter().map(|i| i.name.as_str()))
            .filter(|name| !name.is_empty() && name.to_lowercase().contains(&lower))
            .take(MAX_SUGGESTIONS)
            .collect()
    }
}

fn read_collection<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, TrackerError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Catalog file missing, using empty collection");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&raw)
        .map_err(|e| TrackerError::Catalog(format!("{}: {}", path.display(), e)))
}

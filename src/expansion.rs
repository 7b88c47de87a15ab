//! Dependency expansion
//!
//! Turns a requested resource and quantity into a tree of [`ResourceSpec`]
//! nodes by walking the recipe catalog depth first. The catalog graph may
//! contain cycles, so the ids on the current path are tracked and a repeat
//! becomes an unexpandable leaf.
//!
//! A catalog miss is not an error: the request becomes a single leaf.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::catalog::{CatalogItem, RecipeCatalog};

/// Type tag given to every expanded ingredient
pub const INGREDIENT_TYPE: &str = "item";
/// Type tag for names that resolve to a building type
pub const BUILDING_TYPE: &str = "building";

/// Node tree ready to be persisted by the tree store
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceSpec {
    pub resource: String,
    pub amount: i64,
    pub resource_type: Option<String>,
    pub children: Vec<ResourceSpec>,
}

impl ResourceSpec {
    pub fn leaf(resource: impl Into<String>, amount: i64, resource_type: Option<String>) -> Self {
        Self {
            resource: resource.into(),
            amount,
            resource_type,
            children: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ResourceSpec::node_count).sum::<usize>()
    }

    /// Levels from this node to its deepest leaf (a leaf has depth 1)
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(ResourceSpec::depth).max().unwrap_or(0)
    }
}

pub struct DependencyExpander<'a> {
    catalog: &'a RecipeCatalog,
}

impl<'a> DependencyExpander<'a> {
    pub fn new(catalog: &'a RecipeCatalog) -> Self {
        Self { catalog }
    }

    /// Expand `name` x `quantity` into a node tree
    pub fn expand(&self, name: &str, quantity: i64, type_hint: Option<&str>) -> ResourceSpec {
        let hint = type_hint.map(str::to_string);

        if let Some(item) = self.catalog.resolve_item(name) {
            let mut path = HashSet::new();
            let spec = self.expand_item(item, quantity, hint, &mut path);
            debug!(resource = %spec.resource, nodes = spec.node_count(), depth = spec.depth(), "Expanded resource");
            return spec;
        }

        if let Some(building) = self.catalog.resolve_building(name) {
            return ResourceSpec::leaf(
                building.name.clone(),
                quantity,
                hint.or_else(|| Some(BUILDING_TYPE.to_string())),
            );
        }

        debug!(resource = name, "No catalog entry, inserting leaf");
        ResourceSpec::leaf(name.trim(), quantity, hint)
    }

    fn expand_item(
        &self,
        item: &CatalogItem,
        quantity: i64,
        resource_type: Option<String>,
        path: &mut HashSet<i64>,
    ) -> ResourceSpec {
        let mut spec = ResourceSpec::leaf(item.name.clone(), quantity, resource_type);

        let Some(recipe) = self.catalog.recipe_for(item.id) else {
            return spec;
        };

        path.insert(item.id);

        let per_craft = recipe.output_quantity(item.id);
        let crafts = quantity.saturating_add(per_craft - 1) / per_craft;

        for stack in &recipe.consumed_item_stacks {
            let Some(ingredient) = self.catalog.item(stack.item_id) else {
                warn!(recipe = recipe.id, item_id = stack.item_id, "Recipe ingredient missing from catalog, skipping");
                continue;
            };

            let amount = crafts.saturating_mul(stack.quantity);
            if amount <= 0 {
                warn!(recipe = recipe.id, item_id = stack.item_id, "Non-positive ingredient quantity, skipping");
                continue;
            }

            let child = if path.contains(&ingredient.id) {
                debug!(item_id = ingredient.id, "Cycle in recipe graph, stopping at leaf");
                ResourceSpec::leaf(ingredient.name.clone(), amount, Some(INGREDIENT_TYPE.to_string()))
            } else {
                self.expand_item(ingredient, amount, Some(INGREDIENT_TYPE.to_string()), path)
            };
            spec.children.push(child);
        }

        path.remove(&item.id);
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BuildingType, CatalogItem, ItemStack, Recipe};

    fn item(id: i64, name: &str) -> CatalogItem {
        CatalogItem {
            id,
            name: name.to_string(),
            tier: 1,
            description: String::new(),
            icon_asset_name: String::new(),
        }
    }

    fn recipe(id: i64, output: (i64, i64), inputs: &[(i64, i64)]) -> Recipe {
        Recipe {
            id,
            name: String::new(),
            crafted_item_stacks: vec![ItemStack { item_id: output.0, quantity: output.1 }],
            consumed_item_stacks: inputs
                .iter()
                .map(|(item_id, quantity)| ItemStack { item_id: *item_id, quantity: *quantity })
                .collect(),
            building_requirement: None,
        }
    }

    #[test]
    fn test_plank_expands_to_logs() {
        let catalog = RecipeCatalog::from_parts(
            vec![item(2, "Log"), item(5, "Plank")],
            vec![recipe(1, (5, 1), &[(2, 2)])],
            vec![],
        );

        let spec = DependencyExpander::new(&catalog).expand("plank", 3, None);
        assert_eq!(spec.resource, "Plank");
        assert_eq!(spec.amount, 3);
        assert_eq!(spec.resource_type, None);
        assert_eq!(
            spec.children,
            vec![ResourceSpec::leaf("Log", 6, Some("item".to_string()))]
        );
    }

    #[test]
    fn test_output_quantity_rounds_crafts_up() {
        let catalog = RecipeCatalog::from_parts(
            vec![item(1, "Nail"), item(2, "Iron Bar")],
            vec![recipe(1, (1, 4), &[(2, 1)])],
            vec![],
        );

        let spec = DependencyExpander::new(&catalog).expand("Nail", 10, Some("part"));
        assert_eq!(spec.resource_type.as_deref(), Some("part"));
        assert_eq!(spec.children[0].amount, 3);
    }

    #[test]
    fn test_cycle_terminates_with_leaf() {
        // A needs B, B needs A
        let catalog = RecipeCatalog::from_parts(
            vec![item(1, "Alpha"), item(2, "Beta")],
            vec![recipe(1, (1, 1), &[(2, 1)]), recipe(2, (2, 1), &[(1, 1)])],
            vec![],
        );

        let spec = DependencyExpander::new(&catalog).expand("Alpha", 1, None);
        assert_eq!(spec.depth(), 3);
        let beta = &spec.children[0];
        assert_eq!(beta.resource, "Beta");
        let alpha_again = &beta.children[0];
        assert_eq!(alpha_again.resource, "Alpha");
        assert!(alpha_again.children.is_empty());
    }

    #[test]
    fn test_self_referencing_recipe() {
        let catalog = RecipeCatalog::from_parts(
            vec![item(7, "Seed")],
            vec![recipe(1, (7, 2), &[(7, 1)])],
            vec![],
        );
        let spec = DependencyExpander::new(&catalog).expand("Seed", 4, None);
        assert_eq!(spec.node_count(), 2);
        assert_eq!(spec.children[0].amount, 2);
    }

    #[test]
    fn test_shared_ingredient_on_sibling_paths_is_expanded() {
        // Wall needs Brick and Mortar, both need Clay
        let catalog = RecipeCatalog::from_parts(
            vec![item(1, "Wall"), item(2, "Brick"), item(3, "Mortar"), item(4, "Clay")],
            vec![
                recipe(1, (1, 1), &[(2, 2), (3, 1)]),
                recipe(2, (2, 1), &[(4, 1)]),
                recipe(3, (3, 1), &[(4, 3)]),
            ],
            vec![],
        );
        let spec = DependencyExpander::new(&catalog).expand("Wall", 1, None);
        assert_eq!(spec.node_count(), 5);
        assert_eq!(spec.children[1].children[0].amount, 3);
    }

    #[test]
    fn test_catalog_miss_and_building() {
        let catalog = RecipeCatalog::from_parts(
            vec![],
            vec![],
            vec![BuildingType { id: 3, name: "Town Hall".into() }],
        );
        let expander = DependencyExpander::new(&catalog);

        let miss = expander.expand("  Mystery  ", 2, None);
        assert_eq!(miss, ResourceSpec::leaf("Mystery", 2, None));

        let hall = expander.expand("town hall", 1, None);
        assert_eq!(hall.resource, "Town Hall");
        assert_eq!(hall.resource_type.as_deref(), Some("building"));
    }

    #[test]
    fn test_unknown_ingredient_skipped() {
        let catalog = RecipeCatalog::from_parts(
            vec![item(1, "Rope"), item(2, "Fiber")],
            vec![recipe(1, (1, 1), &[(2, 3), (99, 1)])],
            vec![],
        );
        let spec = DependencyExpander::new(&catalog).expand("Rope", 1, None);
        assert_eq!(spec.children.len(), 1);
        assert_eq!(spec.children[0].resource, "Fiber");
    }
}

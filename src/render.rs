//! Plain-text rendering of resource forests and search results

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::db::resources::ResourceRow;
use crate::shard::SearchOutcome;

const DONE: &str = "✅";
const OPEN: &str = "❌";

fn render_line(out: &mut String, node: &ResourceRow, depth: usize) {
    let _ = write!(
        out,
        "{}{} **{}** x{}",
        "  ".repeat(depth),
        if node.completed { DONE } else { OPEN },
        node.resource,
        node.amount
    );
    if let Some(kind) = &node.resource_type {
        let _ = write!(out, " ({})", kind);
    }
    let _ = writeln!(out, " [{}/{} {}%]", node.progress, node.amount, node.percent());
}

/// Render a project forest as an indented tree
///
/// Roots are nodes without a parent (or whose parent is not in `nodes`);
/// siblings keep the order they have in `nodes`.
pub fn render_tree(nodes: &[ResourceRow]) -> String {
    let present: HashSet<i64> = nodes.iter().map(|n| n.id).collect();
    let mut children: HashMap<i64, Vec<&ResourceRow>> = HashMap::new();
    let mut roots = Vec::new();

    for node in nodes {
        match node.parent_id {
            Some(parent) if present.contains(&parent) && parent != node.id => {
                children.entry(parent).or_default().push(node)
            }
            _ => roots.push(node),
        }
    }

    let mut out = String::new();
    let mut stack: Vec<(&ResourceRow, usize)> = roots.into_iter().rev().map(|n| (n, 0)).collect();
    let mut seen = HashSet::new();
    while let Some((node, depth)) = stack.pop() {
        if !seen.insert(node.id) {
            continue;
        }
        render_line(&mut out, node, depth);
        if let Some(kids) = children.get(&node.id) {
            stack.extend(kids.iter().rev().map(|k| (*k, depth + 1)));
        }
    }
    out
}

/// One bullet per match, with a trailing marker when shards failed
pub fn render_search(query: &str, outcome: &SearchOutcome) -> String {
    let mut out = String::new();
    if outcome.matches.is_empty() {
        out.push_str("No projects or resources found matching your query.\n");
    } else {
        let _ = writeln!(out, "Search results for `{}`:", query);
        for hit in &outcome.matches {
            let _ = writeln!(
                out,
                "• **{}** (resources: {}) [Communities: {}]",
                hit.project.project,
                hit.project.resources.join(", "),
                hit.communities.join(", ")
            );
        }
    }

    if outcome.is_partial() {
        let shards: Vec<String> = outcome.failed.iter().map(|f| f.shard_id.to_string()).collect();
        let _ = writeln!(out, "_Partial results: no answer from shard(s) {}_", shards.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, name: &str, parent_id: Option<i64>, progress: i64, amount: i64) -> ResourceRow {
        ResourceRow {
            id,
            project_id: 1,
            resource: name.to_string(),
            amount,
            progress,
            completed: progress == amount,
            resource_type: None,
            parent_id,
            deadline: None,
        }
    }

    #[test]
    fn test_render_nested_tree() {
        let mut plank = row(1, "Plank", None, 1, 3);
        plank.resource_type = Some("item".into());
        let nodes = vec![plank, row(2, "Log", Some(1), 6, 6), row(3, "Nails", None, 0, 4)];

        let text = render_tree(&nodes);
        assert_eq!(
            text,
            "❌ **Plank** x3 (item) [1/3 33%]\n  ✅ **Log** x6 [6/6 100%]\n❌ **Nails** x4 [0/4 0%]\n"
        );
    }

    #[test]
    fn test_missing_parent_rendered_as_root() {
        let nodes = vec![row(5, "Rope", Some(42), 0, 1)];
        assert!(render_tree(&nodes).starts_with("❌ **Rope**"));
    }

    #[test]
    fn test_empty_forest() {
        assert_eq!(render_tree(&[]), "");
    }
}

//! Text rendering of the dependency tree for `swarm status --tree`.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::types::{ItemStatus, WorkItem};

const TITLE_WIDTH: usize = 40;

fn status_icon(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Open => "○",
        ItemStatus::InProgress => "◐",
        ItemStatus::Closed => "●",
    }
}

/// Render items as an indented tree.
///
/// An item is nested under its first (lowest id) dependency that is present in
/// `items`; items without such a dependency are roots. Each item is printed once.
pub fn render_dependency_tree(items: &[WorkItem]) -> String {
    let by_id: HashMap<&str, &WorkItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut children: BTreeMap<&str, Vec<&WorkItem>> = BTreeMap::new();
    let mut roots: Vec<&WorkItem> = Vec::new();

    for item in items {
        let parent = item
            .dependencies
            .iter()
            .filter(|d| by_id.contains_key(d.as_str()) && d.as_str() != item.id)
            .min();
        match parent {
            Some(parent) => children.entry(parent.as_str()).or_default().push(item),
            None => roots.push(item),
        }
    }
    roots.sort_by(|a, b| a.id.cmp(&b.id));
    for list in children.values_mut() {
        list.sort_by(|a, b| a.id.cmp(&b.id));
    }

    let mut lines = vec!["Issues".to_string()];
    let mut seen = HashSet::new();
    for root in roots {
        render_node(root, 1, &children, &mut seen, &mut lines);
    }
    lines.join("\n")
}

fn render_node<'a>(
    item: &'a WorkItem,
    depth: usize,
    children: &BTreeMap<&str, Vec<&'a WorkItem>>,
    seen: &mut HashSet<&'a str>,
    lines: &mut Vec<String>,
) {
    if !seen.insert(item.id.as_str()) {
        return;
    }
    let indent = "  ".repeat(depth);
    let kind = item.kind.map_or("?", |k| k.as_str());
    let title: String = item.title.chars().take(TITLE_WIDTH).collect();
    lines.push(format!(
        "{indent}{} [{kind}] {} {title}",
        status_icon(item.status),
        item.short_id()
    ));
    if let Some(list) = children.get(item.id.as_str()) {
        for child in list {
            render_node(child, depth + 1, children, seen, lines);
        }
    }
}

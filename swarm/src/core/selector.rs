//! Deterministic selection of the next claimable work item.

use std::collections::HashMap;

use crate::core::types::{ItemStatus, WorkItem};

/// Pick the item a worker should try to claim next.
///
/// Only open, unassigned items are candidates. Highest priority wins (lowest
/// ordinal); ties break on the lexicographically lowest id so every worker
/// facing the same queue makes the same choice.
pub fn select_next(items: &[WorkItem]) -> Option<&WorkItem> {
    items
        .iter()
        .filter(|item| item.status == ItemStatus::Open && item.is_unassigned())
        .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
}

/// Sort items in selection order (priority, then id).
pub fn sort_by_selection_order(items: &mut [WorkItem]) {
    items.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

/// True iff `item` is open and every dependency is closed.
///
/// Dependencies missing from `all` are treated as unmet.
pub fn is_ready(item: &WorkItem, all: &HashMap<&str, &WorkItem>) -> bool {
    if item.status != ItemStatus::Open {
        return false;
    }
    item.dependencies.iter().all(|dep| {
        all.get(dep.as_str())
            .is_some_and(|d| d.status == ItemStatus::Closed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{in_progress, open_item};

    #[test]
    fn selects_highest_priority_then_lowest_id() {
        let items = vec![
            open_item("bd-3", 2),
            open_item("bd-2", 1),
            open_item("bd-1", 2),
            open_item("bd-0", 1),
        ];
        let selected = select_next(&items).expect("selected");
        assert_eq!(selected.id, "bd-0");
    }

    #[test]
    fn skips_assigned_and_in_progress_items() {
        let mut assigned = open_item("bd-1", 0);
        assigned.assignee = Some("ralph-2".to_string());
        let items = vec![assigned, in_progress("bd-2", "ralph-1"), open_item("bd-9", 3)];
        let selected = select_next(&items).expect("selected");
        assert_eq!(selected.id, "bd-9");
    }

    #[test]
    fn empty_queue_selects_nothing() {
        assert!(select_next(&[]).is_none());
    }

    #[test]
    fn readiness_requires_closed_dependencies() {
        let mut dep = open_item("bd-1", 2);
        let mut child = open_item("bd-2", 2);
        child.dependencies = vec!["bd-1".to_string()];

        let all: HashMap<&str, &WorkItem> = [("bd-1", &dep), ("bd-2", &child)].into();
        assert!(!is_ready(&child, &all));

        dep.status = ItemStatus::Closed;
        let all: HashMap<&str, &WorkItem> = [("bd-1", &dep), ("bd-2", &child)].into();
        assert!(is_ready(&child, &all));

        child.dependencies.push("missing".to_string());
        let all: HashMap<&str, &WorkItem> = [("bd-1", &dep), ("bd-2", &child)].into();
        assert!(!is_ready(&child, &all));
    }
}

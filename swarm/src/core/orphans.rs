//! Classification of claimed items into active and orphaned.

use std::collections::HashSet;

use crate::core::types::{ItemStatus, WorkItem};

/// Claimed items split by whether their assignee is still alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanScan {
    /// `in_progress` items whose assignee has a live worker process.
    pub active: Vec<WorkItem>,
    /// `in_progress` items with no live assignee (including an empty one).
    pub orphaned: Vec<WorkItem>,
}

impl OrphanScan {
    pub fn has_orphans(&self) -> bool {
        !self.orphaned.is_empty()
    }
}

/// Split `in_progress` items by assignee liveness.
///
/// Items in any other status are ignored; output order follows input order.
pub fn classify_claims(items: &[WorkItem], live_workers: &HashSet<String>) -> OrphanScan {
    let mut scan = OrphanScan::default();
    for item in items {
        if item.status != ItemStatus::InProgress {
            continue;
        }
        match item.assignee() {
            Some(assignee) if live_workers.contains(assignee) => scan.active.push(item.clone()),
            _ => scan.orphaned.push(item.clone()),
        }
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{in_progress, open_item};

    #[test]
    fn dead_and_missing_assignees_are_orphaned() {
        let mut unowned = in_progress("bd-3", "x");
        unowned.assignee = None;
        let items = vec![
            in_progress("bd-1", "ralph-1"),
            in_progress("bd-2", "ralph-2"),
            unowned,
            open_item("bd-4", 1),
        ];
        let live: HashSet<String> = ["ralph-1".to_string()].into();

        let scan = classify_claims(&items, &live);
        let active: Vec<&str> = scan.active.iter().map(|i| i.id.as_str()).collect();
        let orphaned: Vec<&str> = scan.orphaned.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(active, vec!["bd-1"]);
        assert_eq!(orphaned, vec!["bd-2", "bd-3"]);
        assert!(scan.has_orphans());
    }

    #[test]
    fn nothing_claimed_means_nothing_orphaned() {
        let scan = classify_claims(&[open_item("bd-1", 0)], &HashSet::new());
        assert_eq!(scan, OrphanScan::default());
    }
}

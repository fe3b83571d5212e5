//! Dependency graph checks.

use std::collections::{HashMap, HashSet};

/// Would adding the edge `child` depends-on `parent` close a cycle?
///
/// `dependencies` maps an item id to the ids it already depends on.
pub fn creates_cycle(
    dependencies: &HashMap<String, Vec<String>>,
    child: &str,
    parent: &str,
) -> bool {
    if child == parent {
        return true;
    }
    // A cycle exists iff `parent` already reaches `child`.
    let mut stack = vec![parent];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == child {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(deps) = dependencies.get(current) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    false
}

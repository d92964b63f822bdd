//! Walks over the parent links of an entry arena.

use std::collections::HashSet;

use crate::types::{EntryIndex, SessionEntry};

/// Indices from the root to `leaf`, root first. Unknown indices end the walk.
pub fn branch_path(entries: &[SessionEntry], leaf: Option<EntryIndex>) -> Vec<EntryIndex> {
    let mut path = Vec::new();
    let mut cursor = leaf;
    while let Some(index) = cursor {
        let Some(entry) = entries.get(index) else {
            break;
        };
        // Parents always precede children; guard against corrupt input anyway.
        if path.len() > entries.len() {
            break;
        }
        path.push(index);
        cursor = entry.parent;
    }
    path.reverse();
    path
}

/// Deepest entry shared by the branches ending at `a` and `b`.
pub fn common_ancestor(
    entries: &[SessionEntry],
    a: Option<EntryIndex>,
    b: Option<EntryIndex>,
) -> Option<EntryIndex> {
    let on_a: HashSet<EntryIndex> = branch_path(entries, a).into_iter().collect();
    branch_path(entries, b)
        .into_iter()
        .rev()
        .find(|index| on_a.contains(index))
}

pub fn is_ancestor_or_self(
    entries: &[SessionEntry],
    ancestor: EntryIndex,
    descendant: Option<EntryIndex>,
) -> bool {
    branch_path(entries, descendant).contains(&ancestor)
}

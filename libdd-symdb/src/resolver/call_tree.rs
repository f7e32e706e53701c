// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Returns the smallest total a node must have to be kept when at most
/// `max_nodes` nodes are: the `max_nodes`-th largest of `totals`. Returns 0
/// when nothing has to be truncated.
pub(crate) fn min_value(totals: impl Iterator<Item = i64>, max_nodes: u64) -> i64 {
    let Ok(max_nodes) = usize::try_from(max_nodes) else {
        return 0;
    };
    if max_nodes == 0 {
        return 0;
    }
    let mut heap = BinaryHeap::with_capacity(max_nodes + 1);
    let mut size = 0usize;
    for total in totals {
        size += 1;
        if heap.len() < max_nodes {
            heap.push(Reverse(total));
        } else if heap.peek().is_some_and(|Reverse(min)| total > *min) {
            heap.pop();
            heap.push(Reverse(total));
        }
    }
    if size <= max_nodes {
        return 0;
    }
    heap.peek().map_or(0, |Reverse(min)| *min)
}

/// A call tree keyed by function: two stack traces that go through the
/// same functions share their nodes, whatever the locations.
pub(crate) struct CallTree {
    /// Totals by node; node 0 is the root.
    totals: Vec<i64>,
    children: FxHashMap<(u32, u32), u32>,
}

impl Default for CallTree {
    fn default() -> Self {
        Self {
            totals: vec![0],
            children: FxHashMap::default(),
        }
    }
}

impl CallTree {
    pub(crate) const ROOT: u32 = 0;

    /// Returns the child of `parent` for `function`, creating it if needed.
    pub(crate) fn child(&mut self, parent: u32, function: u32) -> u32 {
        let next = self.totals.len() as u32;
        let node = *self.children.entry((parent, function)).or_insert(next);
        if node == next {
            self.totals.push(0);
        }
        node
    }

    pub(crate) fn add(&mut self, node: u32, value: i64) {
        if let Some(total) = self.totals.get_mut(node as usize) {
            *total += value;
        }
    }

    pub(crate) fn total(&self, node: u32) -> i64 {
        self.totals.get(node as usize).copied().unwrap_or(0)
    }

    /// Number of nodes, the root excluded.
    pub(crate) fn len(&self) -> usize {
        self.totals.len() - 1
    }

    /// See [`min_value`]. The root does not count.
    pub(crate) fn min_value(&self, max_nodes: u64) -> i64 {
        min_value(self.totals[1..].iter().copied(), max_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_largest_total() {
        let totals = [5, 5, 5, 1, 2, 1, 2, 2, 1];
        assert_eq!(min_value(totals.iter().copied(), 6), 2);
        assert_eq!(min_value(totals.iter().copied(), 3), 5);
        assert_eq!(min_value(totals.iter().copied(), 9), 0);
        assert_eq!(min_value(totals.iter().copied(), 0), 0);
    }

    #[test]
    fn shared_function_paths() {
        let mut tree = CallTree::default();
        let mut insert = |functions: &[u32], value: i64| {
            let mut node = CallTree::ROOT;
            tree.add(node, value);
            for &f in functions {
                node = tree.child(node, f);
                tree.add(node, value);
            }
            node
        };
        let a = insert(&[1, 2], 3);
        let b = insert(&[1, 2], 4);
        let c = insert(&[1, 3], 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.total(CallTree::ROOT), 8);
        assert_eq!(tree.total(a), 7);
        assert_eq!(tree.min_value(2), 7);
    }
}

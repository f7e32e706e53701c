// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{ResolveStacktrace, TreeEncoder};
use std::io;

pub(crate) const SENTINEL: i32 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Node {
    /// Parent node index.
    pub(crate) p: i32,
    /// Location reference.
    pub(crate) r: i32,
    /// First child and next sibling, used only while building the tree.
    pub(crate) fc: i32,
    pub(crate) ns: i32,
}

impl Node {
    const ROOT: Node = Node {
        p: SENTINEL,
        r: 0,
        fc: SENTINEL,
        ns: SENTINEL,
    };
}

/// The insert-side stack trace tree: a trie of locations where each node
/// knows its first child and next sibling.
///
/// Nodes are only ever appended, and the parent and location of a node never
/// change once it is created, so a stack trace id stays valid for the
/// lifetime of the tree.
#[derive(Clone, Debug)]
pub struct StacktraceTree {
    pub(crate) nodes: Vec<Node>,
}

impl Default for StacktraceTree {
    fn default() -> Self {
        Self::new(0)
    }
}

impl StacktraceTree {
    pub fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity.max(1));
        nodes.push(Node::ROOT);
        Self { nodes }
    }

    /// Returns the number of nodes, the root included.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Inserts the stack trace and returns its id. `refs` is leaf-first:
    /// the walk starts from the last element, at the root of the tree.
    ///
    /// Inserting the same stack trace again returns the same id. An empty
    /// stack trace is the root, id 0.
    pub fn insert(&mut self, refs: &[u32]) -> u32 {
        let mut current = 0usize;
        'frames: for &r in refs.iter().rev() {
            let r = r as i32;
            let mut last = SENTINEL;
            let mut child = self.nodes[current].fc;
            // Fan-out is small: a linear scan of the siblings is fine.
            while child != SENTINEL {
                let node = &self.nodes[child as usize];
                if node.r == r {
                    current = child as usize;
                    continue 'frames;
                }
                last = child;
                child = node.ns;
            }
            let n = self.nodes.len();
            self.nodes.push(Node {
                p: current as i32,
                r,
                fc: SENTINEL,
                ns: SENTINEL,
            });
            if last == SENTINEL {
                self.nodes[current].fc = n as i32;
            } else {
                self.nodes[last as usize].ns = n as i32;
            }
            current = n;
        }
        current as u32
    }

    /// Writes the parent-pointer representation of the tree and returns the
    /// number of bytes written.
    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<u64> {
        TreeEncoder::default().encode(self.nodes.iter().map(|n| (n.p, n.r)), w)
    }

    /// Iterates over `(parent, location)` pairs in node order.
    pub fn parent_pointers(&self) -> impl ExactSizeIterator<Item = (i32, i32)> + '_ {
        self.nodes.iter().map(|n| (n.p, n.r))
    }
}

impl ResolveStacktrace for StacktraceTree {
    fn resolve(&self, dst: &mut Vec<u32>, id: u32) {
        dst.clear();
        if id as usize >= self.nodes.len() {
            return;
        }
        let mut i = id as i32;
        while i > 0 {
            let node = &self.nodes[i as usize];
            dst.push(node.r as u32);
            i = node.p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacktraces::ParentPointerTree;
    use proptest::prelude::*;

    const STACKS: &[&[u32]] = &[
        &[5, 4, 3, 2, 1],
        &[6, 4, 3, 2, 1],
        &[4, 3, 2, 1],
        &[3, 2, 1],
        &[4, 2, 1],
        &[7, 2, 1],
        &[2, 1],
        &[1],
    ];

    #[test]
    fn insert_is_idempotent() {
        let mut tree = StacktraceTree::new(10);
        let ids: Vec<u32> = STACKS.iter().map(|s| tree.insert(s)).collect();
        let len = tree.len();
        let again: Vec<u32> = STACKS.iter().map(|s| tree.insert(s)).collect();
        assert_eq!(ids, again);
        assert_eq!(len, tree.len());
        // 1, 2, 3, 4, 5 | 6 | 4 under 2 | 7 under 2.
        assert_eq!(tree.len(), 1 + 5 + 1 + 1 + 1);
    }

    #[test]
    fn resolve_returns_leaf_first() {
        let mut tree = StacktraceTree::new(10);
        for stack in STACKS {
            let id = tree.insert(stack);
            let mut dst = Vec::new();
            tree.resolve(&mut dst, id);
            assert_eq!(&dst, stack);
        }
    }

    #[test]
    fn resolve_out_of_range() {
        let tree = StacktraceTree::new(0);
        let mut dst = vec![1, 2, 3];
        for id in [0, 1, 2, 3, 42] {
            tree.resolve(&mut dst, id);
            assert!(dst.is_empty());
        }
        let ppt = ParentPointerTree::new(0);
        ppt.resolve(&mut dst, 42);
        assert!(dst.is_empty());
    }

    #[test]
    fn node_layout() {
        let mut tree = StacktraceTree::new(4);
        assert_eq!(tree.insert(&[]), 0);
        assert_eq!(tree.insert(&[2, 1]), 2);
        assert_eq!(tree.insert(&[3, 1]), 3);
        let nodes: Vec<_> = tree.parent_pointers().collect();
        assert_eq!(nodes, vec![(-1, 0), (0, 1), (1, 2), (1, 3)]);
        assert_eq!(tree.nodes[1].fc, 2);
        assert_eq!(tree.nodes[2].ns, 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            .. ProptestConfig::default()
        })]

        #[test]
        fn proptest_resolve_after_encoding(
            stacks in proptest::collection::vec(
                proptest::collection::vec(1u32..64, 0..24),
                0..64,
            )
        ) {
            let mut tree = StacktraceTree::new(0);
            let ids: Vec<u32> = stacks.iter().map(|s| tree.insert(s)).collect();

            let mut buf = Vec::new();
            let n = tree.write_to(&mut buf).unwrap();
            prop_assert_eq!(n as usize, buf.len());
            let ppt = ParentPointerTree::decode(&buf, tree.len() as u32).unwrap();

            let mut dst = Vec::new();
            for (stack, &id) in stacks.iter().zip(&ids) {
                ppt.resolve(&mut dst, id);
                prop_assert_eq!(&dst, stack);
                prop_assert_eq!(tree.insert(stack), id);
            }
        }
    }
}

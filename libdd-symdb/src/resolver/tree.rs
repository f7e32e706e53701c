// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::call_tree::min_value;
use std::fmt;
use std::io;

/// Name of the node that stands for everything truncated under a parent.
pub const TRUNCATED_NODE_NAME: &str = "other";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct Node {
    name: Box<str>,
    self_value: i64,
    total: i64,
    parent: usize,
    /// Sorted by name.
    children: Vec<usize>,
}

/// A flame graph tree: one node per distinct root-first path of function
/// names, with the value of the samples ending at the node (`self`) and
/// of the samples going through it (`total`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tree {
    /// Node 0 is a nameless root.
    nodes: Vec<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes, the root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total(&self) -> i64 {
        self.nodes[0].total
    }

    /// Adds `value` to the root-first `stack`. Non-positive values are
    /// ignored.
    pub fn insert_stack<S: AsRef<str>>(&mut self, value: i64, stack: &[S]) {
        if value <= 0 {
            return;
        }
        let mut n = 0;
        self.nodes[0].total += value;
        for name in stack {
            n = self.child(n, name.as_ref());
            self.nodes[n].total += value;
        }
        self.nodes[n].self_value += value;
    }

    /// Adds every node of `src` to the tree.
    pub fn merge(&mut self, src: &Tree) {
        if src.total() == 0 && src.is_empty() {
            return;
        }
        let mut stack = vec![(0usize, 0usize)];
        while let Some((s, d)) = stack.pop() {
            let node = &src.nodes[s];
            self.nodes[d].self_value += node.self_value;
            self.nodes[d].total += node.total;
            for &c in &node.children {
                let child = self.child(d, &src.nodes[c].name);
                stack.push((c, child));
            }
        }
    }

    /// Collapses the nodes that do not make it into the `max_nodes` largest
    /// totals: under every parent, they are replaced with a single node
    /// named [`TRUNCATED_NODE_NAME`]. Totals are preserved.
    pub fn truncate(&mut self, max_nodes: u64) {
        let min = min_value(self.nodes[1..].iter().map(|n| n.total), max_nodes);
        if min == 0 {
            return;
        }
        let mut dst = Tree::default();
        dst.nodes[0].self_value = self.nodes[0].self_value;
        dst.nodes[0].total = self.nodes[0].total;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((s, d)) = stack.pop() {
            let mut other = 0;
            for &c in &self.nodes[s].children {
                let node = &self.nodes[c];
                if node.total >= min || &*node.name == TRUNCATED_NODE_NAME {
                    let child = dst.child(d, &node.name);
                    dst.nodes[child].self_value += node.self_value;
                    dst.nodes[child].total += node.total;
                    stack.push((c, child));
                } else {
                    other += node.total;
                }
            }
            if other > 0 {
                let child = dst.child(d, TRUNCATED_NODE_NAME);
                dst.nodes[child].self_value += other;
                dst.nodes[child].total += other;
            }
        }
        *self = dst;
    }

    /// Writes every stack that has a self value in the collapsed format:
    /// `a;b;c 42`, one per line, breadth-first.
    pub fn write_collapsed<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        let mut queue = std::collections::VecDeque::from_iter(self.nodes[0].children.iter().copied());
        let mut stack = Vec::new();
        while let Some(n) = queue.pop_front() {
            let node = &self.nodes[n];
            if node.self_value > 0 {
                stack.clear();
                let mut cur = n;
                while cur != 0 {
                    stack.push(&*self.nodes[cur].name);
                    cur = self.nodes[cur].parent;
                }
                stack.reverse();
                writeln!(w, "{} {}", stack.join(";"), node.self_value)?;
            }
            queue.extend(node.children.iter().copied());
        }
        Ok(())
    }

    fn child(&mut self, parent: usize, name: &str) -> usize {
        let children = &self.nodes[parent].children;
        match children.binary_search_by(|&c| (*self.nodes[c].name).cmp(name)) {
            Ok(i) => children[i],
            Err(i) => {
                let id = self.nodes.len();
                self.nodes.push(Node {
                    name: name.into(),
                    parent,
                    ..Default::default()
                });
                self.nodes[parent].children.insert(i, id);
                id
            }
        }
    }

    fn fmt_children(&self, f: &mut fmt::Formatter<'_>, n: usize, prefix: &str) -> fmt::Result {
        let children = &self.nodes[n].children;
        for (i, &c) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let node = &self.nodes[c];
            writeln!(
                f,
                "{prefix}{}{}: self {} total {}",
                if last { "└── " } else { "├── " },
                node.name,
                node.self_value,
                node.total
            )?;
            let prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
            self.fmt_children(f, c, &prefix)?;
        }
        Ok(())
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".")?;
        self.fmt_children(f, 0, "")
    }
}

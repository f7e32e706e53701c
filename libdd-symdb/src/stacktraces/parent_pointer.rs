// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::tree::{Node, SENTINEL};
use super::{ResolveStacktrace, StacktraceTree, TreeDecoder};
use crate::FormatError;
use std::io;

/// The read-side stack trace tree: only the parent link and the location
/// of every node are kept.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParentPointerTree {
    nodes: Vec<(i32, i32)>,
}

impl ParentPointerTree {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Decodes a tree of `nodes` nodes from `src`, which must hold exactly
    /// the encoded tree.
    pub fn decode(src: &[u8], nodes: u32) -> Result<Self, FormatError> {
        // A group takes at least 5 bytes and holds two nodes.
        if u64::from(nodes) > 2 * (src.len() as u64 / 5 + 1) {
            return Err(FormatError::InvalidSize);
        }
        let mut tree = Self::with_len(nodes as usize)?;
        TreeDecoder::default().decode_slice(&mut tree.nodes, src)?;
        tree.validate()?;
        Ok(tree)
    }

    /// Reads a tree of `nodes` nodes from `r` and returns it along with the
    /// number of bytes it took.
    pub fn read_from<R: io::Read>(r: &mut R, nodes: u32) -> io::Result<(Self, u64)> {
        let mut tree = Self::with_len(nodes as usize)?;
        let n = TreeDecoder::default().decode(&mut tree.nodes, r)?;
        tree.validate()?;
        Ok((tree, n))
    }

    fn with_len(len: usize) -> Result<Self, FormatError> {
        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(len)
            .map_err(|_| FormatError::InvalidSize)?;
        nodes.resize(len, (0, 0));
        Ok(Self { nodes })
    }

    /// Every parent must precede its child, which also guarantees that
    /// resolution terminates.
    fn validate(&self) -> Result<(), FormatError> {
        for (i, &(p, _)) in self.nodes.iter().enumerate() {
            let valid = if i == 0 {
                p == SENTINEL
            } else {
                p >= 0 && (p as usize) < i
            };
            if !valid {
                return Err(FormatError::Malformed("invalid parent reference"));
            }
        }
        Ok(())
    }

    /// Rebuilds the insert-side tree, so that more stack traces can be added
    /// to a decoded chunk without changing the ids of the existing ones.
    pub fn to_stacktrace_tree(&self) -> StacktraceTree {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|&(p, r)| Node {
                p,
                r,
                fc: SENTINEL,
                ns: SENTINEL,
            })
            .collect();
        if nodes.is_empty() {
            return StacktraceTree::default();
        }
        let mut last_child = vec![SENTINEL; nodes.len()];
        for i in 1..nodes.len() {
            let p = nodes[i].p as usize;
            match last_child[p] {
                SENTINEL => nodes[p].fc = i as i32,
                last => nodes[last as usize].ns = i as i32,
            }
            last_child[p] = i as i32;
        }
        StacktraceTree { nodes }
    }
}

impl ResolveStacktrace for ParentPointerTree {
    fn resolve(&self, dst: &mut Vec<u32>, id: u32) {
        dst.clear();
        if id as usize >= self.nodes.len() {
            return;
        }
        let mut i = id as i32;
        while i > 0 {
            let (p, r) = self.nodes[i as usize];
            dst.push(r as u32);
            i = p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACKS: &[&[u32]] = &[
        &[5, 4, 3, 2, 1],
        &[6, 4, 3, 2, 1],
        &[4, 3, 2, 1],
        &[3, 2, 1],
        &[4, 2, 1],
        &[7, 2, 1],
        &[2, 1],
    ];

    fn encoded(tree: &StacktraceTree) -> Vec<u8> {
        let mut buf = Vec::new();
        tree.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn resolve_decoded_stacks() {
        let mut tree = StacktraceTree::new(16);
        let ids: Vec<u32> = STACKS.iter().map(|s| tree.insert(s)).collect();
        let ppt = ParentPointerTree::decode(&encoded(&tree), tree.len() as u32).unwrap();
        assert_eq!(ppt.len(), tree.len());

        let mut dst = Vec::new();
        for (stack, id) in STACKS.iter().zip(ids) {
            ppt.resolve(&mut dst, id);
            assert_eq!(&dst, stack);
        }
        ppt.resolve(&mut dst, 0);
        assert!(dst.is_empty());
    }

    #[test]
    fn read_from_reports_size() {
        let mut tree = StacktraceTree::new(16);
        for stack in STACKS {
            tree.insert(stack);
        }
        let mut buf = encoded(&tree);
        let size = buf.len() as u64;
        buf.extend_from_slice(b"next chunk");
        let (ppt, n) = ParentPointerTree::read_from(&mut buf.as_slice(), tree.len() as u32).unwrap();
        assert_eq!(n, size);
        assert_eq!(ppt.len(), tree.len());
    }

    #[test]
    fn restored_tree_matches_original() {
        let mut tree = StacktraceTree::new(16);
        for stack in STACKS {
            tree.insert(stack);
        }
        let ppt = ParentPointerTree::decode(&encoded(&tree), tree.len() as u32).unwrap();
        let mut restored = ppt.to_stacktrace_tree();
        assert_eq!(restored.nodes, tree.nodes);

        // Existing stack traces keep their ids, new ones are appended.
        for stack in STACKS {
            assert_eq!(restored.insert(stack), tree.insert(stack));
        }
        assert_eq!(restored.insert(&[8, 1]), tree.insert(&[8, 1]));
        assert_eq!(restored.nodes, tree.nodes);
    }

    #[test]
    fn rejects_forward_parent() {
        let mut buf = Vec::new();
        super::super::TreeEncoder::default()
            .encode([(-1, 0), (2, 1), (0, 2)].into_iter(), &mut buf)
            .unwrap();
        assert_eq!(
            ParentPointerTree::decode(&buf, 3),
            Err(FormatError::Malformed("invalid parent reference"))
        );

        let mut buf = Vec::new();
        super::super::TreeEncoder::default()
            .encode([(0, 0)].into_iter(), &mut buf)
            .unwrap();
        assert!(ParentPointerTree::decode(&buf, 1).is_err());
    }

    #[test]
    fn node_count_is_bounded_by_size() {
        let mut tree = StacktraceTree::new(16);
        for stack in STACKS {
            tree.insert(stack);
        }
        let buf = encoded(&tree);
        assert_eq!(
            ParentPointerTree::decode(&buf, u32::MAX),
            Err(FormatError::InvalidSize)
        );
        assert_eq!(
            ParentPointerTree::decode(&[], 3),
            Err(FormatError::InvalidSize)
        );
        assert!(ParentPointerTree::decode(&buf, tree.len() as u32).is_ok());
    }

    #[test]
    fn fuzz_decode_never_panics() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|bytes| {
            if let Ok(ppt) = ParentPointerTree::decode(bytes, 64) {
                let mut dst = Vec::new();
                for id in 0..64 {
                    ppt.resolve(&mut dst, id);
                    assert!(dst.len() < 64);
                }
            }
        });
    }
}

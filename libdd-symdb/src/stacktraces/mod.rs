// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack traces are stored as a tree of locations: a stack trace id is the
//! id of the node representing its leaf frame, and the stack trace is
//! recovered by walking the parent links up to the root.

mod encoding;
mod parent_pointer;
mod tree;

pub use encoding::*;
pub use parent_pointer::*;
pub use tree::*;

use crate::SymdbError;
use std::ops::Range;
use std::sync::Arc;

/// Receives resolved stack traces. `locations` are leaf-first and the slice
/// is only valid for the duration of the call.
pub trait StacktraceInserter {
    fn insert_stacktrace(&mut self, stacktrace_id: u32, locations: &[u32]);
}

impl<F: FnMut(u32, &[u32])> StacktraceInserter for F {
    fn insert_stacktrace(&mut self, stacktrace_id: u32, locations: &[u32]) {
        self(stacktrace_id, locations)
    }
}

/// Anything that can turn a (chunk-local) stack trace id into its
/// locations.
pub trait ResolveStacktrace {
    /// Replaces the contents of `dst` with the leaf-first locations of the
    /// stack trace. Unknown ids resolve to an empty stack trace.
    fn resolve(&self, dst: &mut Vec<u32>, id: u32);
}

impl<T: ResolveStacktrace + ?Sized> ResolveStacktrace for Arc<T> {
    fn resolve(&self, dst: &mut Vec<u32>, id: u32) {
        (**self).resolve(dst, id)
    }
}

impl<T: ResolveStacktrace + ?Sized> ResolveStacktrace for &T {
    fn resolve(&self, dst: &mut Vec<u32>, id: u32) {
        (**self).resolve(dst, id)
    }
}

/// A run of stack trace ids that belong to the same chunk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StacktracesRange {
    pub chunk: u32,
    /// The id of the first node of the chunk: `chunk * max_nodes`.
    pub offset: u32,
    /// Indexes into the slice given to [`split_stacktraces`].
    pub ids: Range<usize>,
}

/// Splits `ids` into runs of ids belonging to the same chunk of `n` nodes,
/// and rewrites every id in place to its chunk-local value, so that
/// `range.offset + ids[i]` is the original id. With `n == 0` (unbounded
/// chunks) the whole input is a single run of chunk 0.
///
/// Ids are expected to be sorted; unsorted input still resolves correctly
/// but yields more ranges.
pub fn split_stacktraces(ids: &mut [u32], n: u32) -> Vec<StacktracesRange> {
    if ids.is_empty() {
        return Vec::new();
    }
    if n == 0 {
        return vec![StacktracesRange {
            chunk: 0,
            offset: 0,
            ids: 0..ids.len(),
        }];
    }
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chunk = ids[0] / n;
    for (i, id) in ids.iter_mut().enumerate() {
        let c = *id / n;
        if c != chunk {
            ranges.push(StacktracesRange {
                chunk,
                offset: chunk * n,
                ids: start..i,
            });
            start = i;
            chunk = c;
        }
        *id -= c * n;
    }
    ranges.push(StacktracesRange {
        chunk,
        offset: chunk * n,
        ids: start..ids.len(),
    });
    ranges
}

/// Resolves `ids` against a chunked tree and calls `inserter` for each of
/// them with the original (global) stack trace id. `ids` are rewritten to
/// chunk-local values.
pub fn resolve_chunked<T: ResolveStacktrace>(
    chunks: &[T],
    max_nodes_per_chunk: u32,
    inserter: &mut dyn StacktraceInserter,
    ids: &mut [u32],
) -> Result<(), SymdbError> {
    let ranges = split_stacktraces(ids, max_nodes_per_chunk);
    let mut locations = Vec::with_capacity(64);
    for range in ranges {
        let tree = chunks
            .get(range.chunk as usize)
            .ok_or(SymdbError::InvalidStacktraceRange)?;
        for &id in &ids[range.ids] {
            tree.resolve(&mut locations, id);
            inserter.insert_stacktrace(range.offset + id, &locations);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn split_sparse_ids() {
        let mut ids = vec![1, 2, 5, 7, 11];
        let ranges = split_stacktraces(&mut ids, 4);
        assert_eq!(
            ranges,
            vec![
                StacktracesRange { chunk: 0, offset: 0, ids: 0..2 },
                StacktracesRange { chunk: 1, offset: 4, ids: 2..4 },
                StacktracesRange { chunk: 2, offset: 8, ids: 4..5 },
            ]
        );
        assert_eq!(ids, vec![1, 2, 1, 3, 3]);
    }

    #[test]
    fn split_unbounded_and_empty() {
        assert!(split_stacktraces(&mut [], 4).is_empty());
        let mut ids = vec![10, 20, 30];
        let ranges = split_stacktraces(&mut ids, 0);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].ids, 0..3);
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn split_single_chunk_far_away() {
        let mut ids = vec![100, 101];
        let ranges = split_stacktraces(&mut ids, 10);
        assert_eq!(
            ranges,
            vec![StacktracesRange { chunk: 10, offset: 100, ids: 0..2 }]
        );
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn resolve_chunked_reports_missing_chunk() {
        let mut tree = StacktraceTree::new(8);
        let id = tree.insert(&[2, 1]);
        let mut seen = Vec::new();
        let mut ids = vec![id];
        resolve_chunked(
            &[&tree],
            0,
            &mut |sid: u32, locs: &[u32]| seen.push((sid, locs.to_vec())),
            &mut ids,
        )
        .unwrap();
        assert_eq!(seen, vec![(id, vec![2, 1])]);

        let mut ids = vec![id, 9];
        let err = resolve_chunked(&[&tree], 4, &mut |_: u32, _: &[u32]| {}, &mut ids).unwrap_err();
        assert!(matches!(err, SymdbError::InvalidStacktraceRange));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            .. ProptestConfig::default()
        })]

        #[test]
        fn proptest_split_reassembles(
            mut ids in proptest::collection::vec(0u32..100_000, 0..256),
            n in 1u32..5_000,
        ) {
            ids.sort_unstable();
            ids.dedup();
            let original = ids.clone();
            let ranges = split_stacktraces(&mut ids, n);
            let mut covered = 0;
            for range in &ranges {
                prop_assert_eq!(range.ids.start, covered);
                covered = range.ids.end;
                prop_assert_eq!(range.offset, range.chunk * n);
                for i in range.ids.clone() {
                    prop_assert!(ids[i] < n);
                    prop_assert_eq!(range.chunk * n + ids[i], original[i]);
                }
            }
            prop_assert_eq!(covered, original.len());
            // Sorted input: one range per chunk.
            for w in ranges.windows(2) {
                prop_assert!(w[0].chunk < w[1].chunk);
            }
        }
    }
}

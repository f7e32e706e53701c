// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec::ChecksumWriter;
use crate::collections::{DedupTable, FxHashMap};
use crate::format::{ChunkEncoding, PartitionHeaderV3, StacktraceBlockHeader};
use crate::stacktraces::{resolve_chunked, StacktraceInserter, StacktraceTree};
use crate::symbols::{Function, Location, Mapping, Symbols, SymbolsEncoder};
use crate::SymdbError;
use parking_lot::RwLock;
use std::sync::Arc;

pub(crate) struct Chunk {
    /// Global id of the first node of the chunk.
    pub(crate) offset: u32,
    pub(crate) tree: StacktraceTree,
    pub(crate) stacktraces: u32,
    pub(crate) max_depth: u32,
}

impl Chunk {
    fn new(offset: u32) -> Self {
        Self {
            offset,
            tree: StacktraceTree::default(),
            stacktraces: 0,
            max_depth: 0,
        }
    }
}

struct Stacktraces {
    chunks: Vec<Chunk>,
    /// Every stack trace appended so far, by its full list of locations. A
    /// stack trace keeps the id it got first even after the chunk it lives
    /// in has been closed.
    ids: FxHashMap<Box<[u32]>, u32>,
}

impl Stacktraces {
    fn insert(&mut self, stacktrace: &[u32], max_nodes: u32) -> Result<u32, SymdbError> {
        if let Some(&id) = self.ids.get(stacktrace) {
            return Ok(id);
        }
        let mut frames = stacktrace;
        if max_nodes > 0 {
            let max = max_nodes as usize;
            let full = self
                .chunks
                .last()
                .map_or(true, |c| c.tree.len() > 1 && c.tree.len() + frames.len() >= max);
            if full {
                let offset = u32::try_from(self.chunks.len())
                    .ok()
                    .and_then(|n| n.checked_mul(max_nodes))
                    .ok_or_else(|| SymdbError::other("stack trace id space exhausted"))?;
                self.chunks.push(Chunk::new(offset));
            }
            // A fresh chunk has room for the root and max - 1 frames.
            if frames.len() >= max {
                tracing::warn!(
                    frames = frames.len(),
                    max_nodes_per_chunk = max_nodes,
                    "Stack trace does not fit in a chunk, dropping the leaf frames"
                );
                frames = &frames[frames.len() - (max - 1)..];
            }
        }
        let chunk = self
            .chunks
            .last_mut()
            .ok_or_else(|| SymdbError::other("no stack trace chunk"))?;
        let local = chunk.tree.insert(frames);
        let id = chunk
            .offset
            .checked_add(local)
            .ok_or_else(|| SymdbError::other("stack trace id space exhausted"))?;
        chunk.stacktraces += 1;
        chunk.max_depth = chunk.max_depth.max(frames.len() as u32);
        self.ids.try_reserve(1)?;
        self.ids.insert(stacktrace.into(), id);
        Ok(id)
    }
}

/// Accumulates the stack traces and symbols of one partition.
///
/// Appends and reads can be made concurrently from any number of threads:
/// stack traces and every symbol table are guarded by their own lock.
pub struct PartitionWriter {
    key: u64,
    max_nodes_per_chunk: u32,
    stacktraces: RwLock<Stacktraces>,
    pub(crate) strings: DedupTable<String>,
    pub(crate) functions: DedupTable<Function>,
    pub(crate) mappings: DedupTable<Mapping>,
    pub(crate) locations: DedupTable<Location>,
}

impl PartitionWriter {
    pub(crate) fn new(key: u64, max_nodes_per_chunk: u32) -> Self {
        Self {
            key,
            max_nodes_per_chunk,
            stacktraces: RwLock::new(Stacktraces {
                chunks: vec![Chunk::new(0)],
                ids: FxHashMap::default(),
            }),
            strings: DedupTable::new(),
            functions: DedupTable::new(),
            mappings: DedupTable::new(),
            locations: DedupTable::new(),
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// The node budget of a stack trace chunk; 0 if unbounded.
    pub fn max_nodes_per_chunk(&self) -> u32 {
        self.max_nodes_per_chunk
    }

    /// Inserts the stack traces, whose elements are leaf-first location ids
    /// of this partition, and writes the id of the i-th stack trace to
    /// `dst[i]`. An empty stack trace gets id 0.
    ///
    /// `dst` may be longer than `stacktraces`: the extra elements are left
    /// untouched.
    pub fn append_stacktraces<S: AsRef<[u32]>>(
        &self,
        dst: &mut [u32],
        stacktraces: &[S],
    ) -> Result<(), SymdbError> {
        if dst.len() < stacktraces.len() {
            return Err(SymdbError::invalid_input(
                "destination is shorter than the stack traces",
            ));
        }
        let dst = &mut dst[..stacktraces.len()];
        let mut misses = 0;
        {
            let st = self.stacktraces.read();
            for (id, s) in dst.iter_mut().zip(stacktraces) {
                let s = s.as_ref();
                *id = st.ids.get(s).copied().unwrap_or(0);
                if *id == 0 && !s.is_empty() {
                    misses += 1;
                }
            }
        }
        if misses == 0 {
            return Ok(());
        }

        let mut st = self.stacktraces.write();
        for (id, s) in dst.iter_mut().zip(stacktraces) {
            let s = s.as_ref();
            if *id == 0 && !s.is_empty() {
                *id = st.insert(s, self.max_nodes_per_chunk)?;
            }
        }
        Ok(())
    }

    pub fn append_locations(&self, dst: &mut Vec<u32>, locations: &[Location]) -> Result<(), SymdbError> {
        self.locations.append(dst, locations)
    }

    pub fn append_mappings(&self, dst: &mut Vec<u32>, mappings: &[Mapping]) -> Result<(), SymdbError> {
        self.mappings.append(dst, mappings)
    }

    pub fn append_functions(&self, dst: &mut Vec<u32>, functions: &[Function]) -> Result<(), SymdbError> {
        self.functions.append(dst, functions)
    }

    pub fn append_strings(&self, dst: &mut Vec<u32>, strings: &[String]) -> Result<(), SymdbError> {
        self.strings.append(dst, strings)
    }

    /// Resolves `ids` to their locations. `ids` are rewritten in place to
    /// chunk-local values.
    pub fn resolve_stacktrace_locations(
        &self,
        inserter: &mut dyn StacktraceInserter,
        ids: &mut [u32],
    ) -> Result<(), SymdbError> {
        let st = self.stacktraces.read();
        let trees: Vec<&StacktraceTree> = st.chunks.iter().map(|c| &c.tree).collect();
        resolve_chunked(&trees, self.max_nodes_per_chunk, inserter, ids)
    }

    /// Copies the symbol tables as they are now.
    pub fn symbols(&self) -> Symbols {
        Symbols {
            strings: Arc::new(self.strings.snapshot()),
            functions: Arc::new(self.functions.snapshot()),
            mappings: Arc::new(self.mappings.snapshot()),
            locations: Arc::new(self.locations.snapshot()),
        }
    }

    /// Approximate number of bytes held by the symbol tables.
    pub fn size(&self) -> usize {
        self.strings.size() + self.functions.size() + self.mappings.size() + self.locations.size()
    }

    /// Appends the encoded stack trace chunks to `buf`.
    pub(crate) fn write_stacktraces(
        &self,
        buf: &mut Vec<u8>,
    ) -> Result<Vec<StacktraceBlockHeader>, SymdbError> {
        let st = self.stacktraces.read();
        let mut headers = Vec::with_capacity(st.chunks.len());
        for (i, chunk) in st.chunks.iter().enumerate() {
            let offset = buf.len() as u64;
            let mut w = ChecksumWriter::new(&mut *buf);
            chunk.tree.write_to(&mut w)?;
            headers.push(StacktraceBlockHeader {
                offset,
                size: w.written(),
                partition: self.key,
                block_index: u16::try_from(i)
                    .map_err(|_| SymdbError::other("too many stack trace chunks"))?,
                encoding: ChunkEncoding::GroupVarint,
                stacktraces: chunk.stacktraces,
                nodes: chunk.tree.len() as u32,
                max_depth: chunk.max_depth,
                max_nodes: self.max_nodes_per_chunk,
                crc: w.crc(),
            });
        }
        Ok(headers)
    }

    /// Appends the encoded symbol tables to `buf`.
    pub(crate) fn write_symbols(
        &self,
        buf: &mut Vec<u8>,
        block_size: usize,
    ) -> Result<PartitionHeaderV3, SymdbError> {
        Ok(PartitionHeaderV3 {
            locations: SymbolsEncoder::<Location>::new(block_size).encode(&self.locations.items(), buf)?,
            mappings: SymbolsEncoder::<Mapping>::new(block_size).encode(&self.mappings.items(), buf)?,
            functions: SymbolsEncoder::<Function>::new(block_size).encode(&self.functions.items(), buf)?,
            strings: SymbolsEncoder::<String>::new(block_size).encode(&self.strings.items(), buf)?,
        })
    }

    /// The number of stack traces and nodes of every chunk.
    pub(crate) fn chunk_stats(&self) -> Vec<(u32, u32)> {
        let st = self.stacktraces.read();
        st.chunks
            .iter()
            .map(|c| (c.stacktraces, c.tree.len() as u32))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn chunk_layout(&self) -> Vec<(u32, usize)> {
        let st = self.stacktraces.read();
        st.chunks.iter().map(|c| (c.offset, c.tree.len())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(w: &PartitionWriter, ids: &[u32]) -> Vec<(u32, Vec<u32>)> {
        let mut resolved = Vec::new();
        let mut ids = ids.to_vec();
        w.resolve_stacktrace_locations(
            &mut |id: u32, locs: &[u32]| resolved.push((id, locs.to_vec())),
            &mut ids,
        )
        .unwrap();
        resolved
    }

    #[test]
    fn chunked_append() {
        let w = PartitionWriter::new(0, 7);
        let mut sids = [0u32; 4];
        w.append_stacktraces(&mut sids, &[vec![3, 2, 1], vec![2, 1], vec![4, 3, 2, 1], vec![3, 1]])
            .unwrap();
        assert_eq!(sids, [3, 2, 11, 16]);

        // Known stack traces keep their ids; dst may be longer.
        w.append_stacktraces(&mut sids, &[vec![3, 2, 1], vec![2, 1], vec![4, 3, 2, 1]])
            .unwrap();
        assert_eq!(sids[..3], [3, 2, 11]);

        w.append_stacktraces(&mut sids[..1], &[vec![5, 2, 1]]).unwrap();
        assert_eq!(sids[0], 18);

        assert_eq!(w.chunk_layout(), vec![(0, 4), (7, 5), (14, 5)]);
    }

    #[test]
    fn unbounded_append() {
        let w = PartitionWriter::new(0, 0);
        let mut sids = [0u32; 5];
        w.append_stacktraces(
            &mut sids,
            &[vec![3, 2, 1], vec![2, 1], vec![4, 3, 2, 1], vec![3, 1], vec![5, 3, 2, 1]],
        )
        .unwrap();
        assert_eq!(sids, [3, 2, 4, 5, 6]);
        assert_eq!(w.chunk_layout(), vec![(0, 7)]);
    }

    #[test]
    fn append_existing_and_empty() {
        let w = PartitionWriter::new(0, 0);
        let mut sids = [0u32; 2];
        w.append_stacktraces(&mut sids, &[vec![5, 4, 3, 2, 1], vec![5, 4, 3, 2, 1]])
            .unwrap();
        assert_eq!(sids, [5, 5]);
        w.append_stacktraces(&mut sids, &[vec![5, 4, 3, 2, 1], vec![6, 5, 4, 3, 2, 1]])
            .unwrap();
        assert_eq!(sids, [5, 6]);

        let mut sids = [0u32; 2];
        w.append_stacktraces::<Vec<u32>>(&mut sids, &[]).unwrap();
        assert_eq!(sids, [0, 0]);
        w.append_stacktraces(&mut sids, &[Vec::<u32>::new()]).unwrap();
        assert_eq!(sids, [0, 0]);

        assert!(w
            .append_stacktraces(&mut sids[..1], &[vec![1], vec![2]])
            .is_err());
    }

    #[test]
    fn resolve_across_chunks() {
        let w = PartitionWriter::new(0, 7);
        let stacktraces = vec![
            vec![3, 2, 1],
            vec![2, 1],
            vec![4, 3, 2, 1],
            vec![3, 1],
            vec![5, 2, 1],
            vec![13, 12, 11],
            vec![12, 11],
            vec![14, 13, 12, 11],
            vec![13, 11],
            vec![15, 12, 11],
        ];
        let mut sids = vec![0u32; stacktraces.len()];
        w.append_stacktraces(&mut sids, &stacktraces).unwrap();
        assert_eq!(sids, vec![3, 2, 11, 16, 18, 24, 23, 32, 37, 39]);
        assert_eq!(w.chunk_layout().len(), 6);

        assert_eq!(
            resolve(&w, &[2, 3, 11, 16, 18]),
            vec![
                (2, vec![2, 1]),
                (3, vec![3, 2, 1]),
                (11, vec![4, 3, 2, 1]),
                (16, vec![3, 1]),
                (18, vec![5, 2, 1]),
            ]
        );
        assert_eq!(
            resolve(&w, &[11, 32]),
            vec![(11, vec![4, 3, 2, 1]), (32, vec![14, 13, 12, 11])]
        );

        let mut ids = vec![100];
        let err = w
            .resolve_stacktrace_locations(&mut |_: u32, _: &[u32]| {}, &mut ids)
            .unwrap_err();
        assert!(matches!(err, SymdbError::InvalidStacktraceRange));
    }

    #[test]
    fn oversized_stack_trace_keeps_root_frames() {
        let w = PartitionWriter::new(0, 4);
        let mut sids = [0u32; 2];
        w.append_stacktraces(&mut sids, &[vec![1, 2], vec![9, 8, 7, 6, 5]])
            .unwrap();
        assert_eq!(sids[0], 2);
        // The second chunk starts at 4 and holds the 3 root-most frames.
        assert_eq!(sids[1], 7);
        assert_eq!(resolve(&w, &[sids[1]]), vec![(7, vec![7, 6, 5])]);
        // Appending it again hits the index instead of truncating again.
        let mut again = [0u32; 1];
        w.append_stacktraces(&mut again, &[vec![9, 8, 7, 6, 5]]).unwrap();
        assert_eq!(again[0], 7);
    }

    #[test]
    fn concurrent_append_and_resolve() {
        let stacktraces: Vec<Vec<u32>> = (0..200u32)
            .map(|i| (0..(i % 9 + 1)).map(|d| (i * 7 + d) % 31 + 1).collect())
            .collect();
        let w = Arc::new(PartitionWriter::new(0, 64));
        let mut expected = vec![0u32; stacktraces.len()];
        w.append_stacktraces(&mut expected, &stacktraces).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let w = w.clone();
                let stacktraces = stacktraces.clone();
                let expected = expected.clone();
                std::thread::spawn(move || {
                    let mut sids = vec![0u32; stacktraces.len()];
                    w.append_stacktraces(&mut sids, &stacktraces).unwrap();
                    assert_eq!(sids, expected);
                    let mut ids = sids.clone();
                    ids.sort_unstable();
                    let mut n = 0;
                    w.resolve_stacktrace_locations(
                        &mut |id: u32, locs: &[u32]| {
                            let i = sids.iter().position(|&s| s == id).unwrap();
                            assert_eq!(locs, &stacktraces[i][..]);
                            n += 1;
                        },
                        &mut ids,
                    )
                    .unwrap();
                    assert_eq!(n, sids.len());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn symbols_snapshot() {
        let w = PartitionWriter::new(1, 0);
        let mut ids = Vec::new();
        w.append_strings(&mut ids, &["main".to_string(), "".to_string()])
            .unwrap();
        assert_eq!(ids, vec![1, 0]);
        ids.clear();
        w.append_functions(&mut ids, &[Function { name: 1, ..Default::default() }])
            .unwrap();
        ids.clear();
        w.append_mappings(&mut ids, &[Mapping::default()]).unwrap();
        assert_eq!(ids, vec![0]);
        let symbols = w.symbols();
        assert_eq!(symbols.function_name(1), "main");
        assert_eq!(symbols.mappings.len(), 1);
        assert!(w.size() > 0);
    }
}

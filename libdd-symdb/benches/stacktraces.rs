// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::*;
use libdd_symdb::stacktraces::{ParentPointerTree, ResolveStacktrace, StacktraceTree};

/// Leaf-first stack traces sharing their root-side frames, the way real
/// profiles do.
fn make_stacks(count: usize) -> Vec<Vec<u32>> {
    let mut state = 0x2545_f491_u32;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    (0..count)
        .map(|_| {
            let depth = 8 + (next() % 24) as usize;
            let mut stack: Vec<u32> = (0..depth)
                .map(|level| 1 + level as u32 * 16 + next() % (1 + level as u32))
                .collect();
            stack.reverse();
            stack
        })
        .collect()
}

pub fn bench_stacktraces(c: &mut Criterion) {
    let stacks = make_stacks(10_000);

    c.bench_function("stacktrace_tree/insert", |b| {
        b.iter(|| {
            let mut tree = StacktraceTree::new(0);
            for s in &stacks {
                black_box(tree.insert(s));
            }
            tree
        })
    });

    let mut tree = StacktraceTree::new(0);
    let ids: Vec<u32> = stacks.iter().map(|s| tree.insert(s)).collect();
    let mut buf = Vec::new();
    tree.write_to(&mut buf).unwrap();

    c.bench_function("stacktrace_tree/encode", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(buf.len());
            tree.write_to(&mut out).unwrap();
            out
        })
    });

    c.bench_function("stacktrace_tree/decode", |b| {
        b.iter(|| ParentPointerTree::decode(black_box(&buf), tree.len() as u32).unwrap())
    });

    let decoded = ParentPointerTree::decode(&buf, tree.len() as u32).unwrap();
    c.bench_function("stacktrace_tree/resolve", |b| {
        let mut locations = Vec::with_capacity(64);
        b.iter(|| {
            for &id in &ids {
                decoded.resolve(&mut locations, id);
                black_box(&locations);
            }
        })
    });
}

criterion_group!(benches, bench_stacktraces);

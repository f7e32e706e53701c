// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::*;
use libdd_symdb::symbols::{
    Function, Line, Location, SymbolsDecoder, SymbolsEncoder, DEFAULT_SYMBOLS_BLOCK_SIZE,
};

fn make_locations(count: u32) -> Vec<Location> {
    (0..count)
        .map(|i| Location {
            address: 0x40_0000 + u64::from(i) * 0x40,
            mapping_id: 1 + i % 3,
            lines: (0..1 + i % 3)
                .map(|l| Line {
                    function_id: i + l,
                    line: 10 + (i % 500) as i32,
                })
                .collect(),
            is_folded: false,
        })
        .collect()
}

fn make_functions(count: u32) -> Vec<Function> {
    (0..count)
        .map(|i| Function {
            name: i * 2,
            system_name: i * 2 + 1,
            filename: i % 64,
            start_line: i % 1000,
        })
        .collect()
}

fn make_strings(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("github.com/example/pkg{}/module.Function{}", i % 97, i))
        .collect()
}

pub fn bench_symbols(c: &mut Criterion) {
    let locations = make_locations(20_000);
    let functions = make_functions(20_000);
    let strings = make_strings(20_000);

    c.bench_function("symbols/encode_locations", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            SymbolsEncoder::<Location>::new(DEFAULT_SYMBOLS_BLOCK_SIZE)
                .encode(black_box(&locations), &mut buf)
                .unwrap();
            buf
        })
    });

    let mut buf = Vec::new();
    let header = SymbolsEncoder::<Location>::default()
        .encode(&locations, &mut buf)
        .unwrap();
    c.bench_function("symbols/decode_locations", |b| {
        b.iter(|| {
            SymbolsDecoder::<Location>::default()
                .decode(&header, black_box(&buf))
                .unwrap()
        })
    });

    c.bench_function("symbols/encode_functions", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            SymbolsEncoder::<Function>::default()
                .encode(black_box(&functions), &mut buf)
                .unwrap();
            buf
        })
    });

    let mut buf = Vec::new();
    let header = SymbolsEncoder::<String>::default()
        .encode(&strings, &mut buf)
        .unwrap();
    c.bench_function("symbols/decode_strings", |b| {
        b.iter(|| {
            SymbolsDecoder::<String>::default()
                .decode(&header, black_box(&buf))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_symbols);

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod dedup_table;
mod rewrites;

pub type SetHasher = core::hash::BuildHasherDefault<rustc_hash::FxHasher>;
pub type FxHashMap<K, V> = std::collections::HashMap<K, V, SetHasher>;
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, SetHasher>;
pub type FxIndexSet<K> = indexmap::IndexSet<K, SetHasher>;

pub use dedup_table::*;
pub use rewrites::*;

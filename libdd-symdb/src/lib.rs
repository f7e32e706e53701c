// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! A symbol database for profiling data.
//!
//! Profiles are decomposed into four deduplicated symbol tables (strings,
//! functions, mappings and locations) plus a stack-trace tree per partition.
//! Samples then only carry `(stack_trace_id, value)` pairs. On the read side
//! the [`resolver::Resolver`] lazily fetches the partitions referenced by a
//! set of samples and rebuilds a [`pprof::Profile`] or a [`resolver::Tree`].

pub mod bucket;
pub mod codec;
pub mod collections;
pub mod config;
pub mod format;
pub mod pprof;
pub mod reader;
pub mod resolver;
pub mod rewriter;
pub mod samples;
pub mod stacktraces;
pub mod symbols;
pub mod writer;

mod error;
mod refcount;

pub use config::*;
pub use error::*;

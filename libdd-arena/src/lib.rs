// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A reserve/commit-on-demand linear allocator with marker-based rewind.
//!
//! Backs the handle-table and string-table crates so that object-with-a-
//! known-upper-bound collections get amortized zero-cost allocation with no
//! fragmentation. Growth is coarse (page-multiple) to amortize OS calls;
//! shrinkage is explicit, scoped to a [`Marker`], and bug-resistant: rewinding
//! past a still-referenced allocation is a caller contract, not something
//! this crate enforces (see `spec.md` §5 aliasing rules).

mod arena;
mod error;
mod spec;

pub use arena::{Arena, Marker, DEFAULT_GROWTH_STEP};
pub use error::ArenaError;
pub use spec::{AllocFlags, AllocatorType, ArenaKind, ArenaSpec, Fourcc, MemoryBlock};

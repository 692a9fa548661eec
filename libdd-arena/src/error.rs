// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by arena operations.
///
/// Propagation is inline, never panics or longjmps: `Create` and `Allocate`
/// return this type, and invariant violations that would indicate a caller
/// bug (a marker from a different arena, rewinding forward) assert in debug
/// builds and no-op in release, per the core's error-handling design.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ArenaError {
    /// The caller violated a precondition of `Create` or `Allocate`.
    #[error("invalid arena arguments: {0}")]
    InvalidArgs(&'static str),

    /// The OS reservation or commit-growth failed; the arena's state is left
    /// unchanged so the caller may retry with a smaller request.
    #[error("arena out of memory")]
    OutOfMemory,

    /// A library-load, heap-allocation, or other OS-boundary call failed.
    #[error("OS-level arena failure: {0}")]
    OsFailure(&'static str),
}

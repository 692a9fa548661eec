// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by handle-table operations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum HandleTableError {
    /// The caller violated a precondition of `Create`, `Ensure`, or
    /// `InsertId`.
    #[error("invalid handle-table arguments: {0}")]
    InvalidArgs(&'static str),

    /// Growing committed capacity failed; state is unchanged.
    #[error("handle table out of memory")]
    OutOfMemory,

    /// `Resolve`/`GetStringInfo`-style lookup failed: the handle is stale,
    /// foreign, or otherwise not currently live in this table.
    #[error("handle not found")]
    NotFound,
}

// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by string-table operations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum StringTableError {
    /// The caller violated a precondition of `Create` or `Rebuild`.
    #[error("invalid string-table arguments: {0}")]
    InvalidArgs(&'static str),

    /// Growing committed capacity failed, or the table's fixed `max_strings`
    /// / `max_data_bytes` ceiling was reached; state is unchanged.
    #[error("string table out of memory")]
    OutOfMemory,

    /// `GetStringInfo` was given a handle outside the data block's valid
    /// range.
    #[error("string not found")]
    NotFound,
}

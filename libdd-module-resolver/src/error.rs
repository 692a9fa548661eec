// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by module loading and dispatch-table population.
#[derive(Debug, Error)]
pub enum ModuleResolverError {
    /// A caller-supplied path or argument was malformed.
    #[error("invalid module-resolver arguments: {0}")]
    InvalidArgs(&'static str),

    /// Resolving a symbol name or module handle failed for a reason the
    /// table logic itself does not model (caller error, not OS error).
    #[error("module or symbol not found: {0}")]
    NotFound(&'static str),

    /// The OS call (`dlopen`/`LoadLibraryW` or equivalent) failed.
    #[error("OS module operation failed: {0}")]
    OsFailure(String),
}

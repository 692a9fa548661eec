// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loads host dynamic libraries and resolves named symbols, auto-binding
//! unresolved dispatch-table entries to caller-supplied stubs so a partially
//! available runtime never hands back a null function pointer.

mod dispatch;
mod error;
mod module;

pub use dispatch::{Dispatch, DispatchEntry, DispatchTable};
pub use error::ModuleResolverError;
pub use module::Module;

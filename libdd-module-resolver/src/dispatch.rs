// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ModuleResolverError;
use crate::module::Module;
use std::ffi::c_void;

/// Describes one function-pointer field of a [`DispatchTable`]: the symbol
/// name to resolve it from, and how to write either the resolved pointer or
/// the stub fallback into `self`.
pub struct DispatchEntry<T> {
    pub symbol: &'static str,
    pub bind: fn(&mut T, Option<*const c_void>),
}

/// A `#[repr(C)]` struct of optional C-ABI function pointers that can be
/// populated from a loaded [`Module`], with every unresolved symbol bound to
/// a caller-supplied stub instead of left null.
///
/// Implement this by hand or via [`impl_dispatch_table!`]; either way,
/// `ENTRIES` must list every field exactly once.
pub trait DispatchTable: Sized {
    const ENTRIES: &'static [DispatchEntry<Self>];

    /// Resolves every entry from `module`, binding unresolved symbols to
    /// their stub. After this returns, no field is null.
    fn populate(&mut self, module: &Module) {
        for entry in Self::ENTRIES {
            let resolved = module.resolve(entry.symbol);
            (entry.bind)(self, resolved);
        }
    }

    /// Overwrites every field with its stub, as if nothing had resolved.
    /// Called before unloading the backing module so a table outlives the
    /// module it was populated from in a well-defined, always-callable
    /// state.
    fn invalidate(&mut self) {
        for entry in Self::ENTRIES {
            (entry.bind)(self, None);
        }
    }
}

/// Generates a [`DispatchTable`] impl for a `#[repr(C)]` function-pointer
/// struct from a `field -> symbol_name, stub` list:
///
/// ```ignore
/// impl_dispatch_table!(MyDispatch {
///     create_window => "CreateWindowImpl", stub_create_window,
///     destroy_window => "DestroyWindowImpl", stub_destroy_window,
/// });
/// ```
#[macro_export]
macro_rules! impl_dispatch_table {
    ($table:ty { $( $field:ident => $symbol:expr, $stub:expr ),+ $(,)? }) => {
        impl $crate::DispatchTable for $table {
            const ENTRIES: &'static [$crate::DispatchEntry<$table>] = &[
                $(
                    $crate::DispatchEntry {
                        symbol: $symbol,
                        bind: |table, resolved| {
                            table.$field = match resolved {
                                // SAFETY: every resolved symbol is expected
                                // to have the same signature as the field
                                // it's bound to; this is a contract of the
                                // macro's caller, not something the loader
                                // can verify.
                                Some(ptr) => Some(unsafe {
                                    std::mem::transmute(ptr)
                                }),
                                None => Some($stub),
                            };
                        },
                    }
                ),+
            ];
        }
    };
}

/// A loaded module paired with a dispatch table populated from it. Owns the
/// module, so dropping this (or calling [`Dispatch::invalidate`]) unloads
/// it.
pub struct Dispatch<T: DispatchTable> {
    module: Option<Module>,
    table: T,
}

impl<T: DispatchTable + Default> Dispatch<T> {
    pub fn new() -> Self {
        Dispatch {
            module: None,
            table: T::default(),
        }
    }

    /// Loads `path` and populates every dispatch-table field from it,
    /// falling back to stubs for anything unresolved.
    pub fn populate(&mut self, path: &str) -> Result<(), ModuleResolverError> {
        let module = Module::load(path)?;
        self.table.populate(&module);
        self.module = Some(module);
        Ok(())
    }

    /// Rebinds every field to its stub and unloads the backing module, if
    /// any. Safe to call whether or not `populate` previously succeeded.
    pub fn invalidate(&mut self) {
        self.table.invalidate();
        self.module = None;
    }

    /// Whether the principal module is currently loaded, for callers that
    /// want to distinguish "running degraded on stubs" from "fully
    /// supported".
    pub fn query_support(&self) -> bool {
        self.module.as_ref().is_some_and(Module::is_valid)
    }

    pub fn table(&self) -> &T {
        &self.table
    }
}

impl<T: DispatchTable + Default> Default for Dispatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    #[repr(C)]
    struct TestDispatch {
        add: Option<unsafe extern "C" fn(i32, i32) -> i32>,
    }

    unsafe extern "C" fn stub_add(_a: i32, _b: i32) -> i32 {
        -1
    }

    crate::impl_dispatch_table!(TestDispatch {
        add => "dispatch_test_add", stub_add,
    });

    #[test]
    fn test_populate_binds_stub_when_symbol_missing() {
        let mut dispatch = Dispatch::<TestDispatch>::new();
        // This module genuinely exists but never exports
        // `dispatch_test_add`, so every field should fall back to its stub.
        let path = if cfg!(windows) { "kernel32.dll" } else { "libc.so.6" };
        if dispatch.populate(path).is_ok() {
            let f = dispatch.table().add.unwrap();
            // SAFETY: `f` is a valid extern "C" fn pointer, either the real
            // symbol or the stub; either is safe to call with these args.
            let result = unsafe { f(1, 2) };
            assert_eq!(-1, result);
        }
    }

    #[test]
    fn test_invalidate_clears_support_and_rebinds_stub() {
        let mut dispatch = Dispatch::<TestDispatch>::new();
        assert!(!dispatch.query_support());
        let path = if cfg!(windows) { "kernel32.dll" } else { "libc.so.6" };
        if dispatch.populate(path).is_ok() {
            dispatch.invalidate();
            assert!(!dispatch.query_support());
            assert!(dispatch.table().add.is_some());
        }
    }
}

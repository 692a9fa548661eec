// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ModuleResolverError;
use std::ffi::c_void;

/// A loaded OS dynamic library. `Drop`s to an unload; `Resolve` hands back
/// an untyped function pointer that callers cast to the signature they
/// expect.
pub struct Module {
    handle: *mut c_void,
    path: String,
}

impl Module {
    /// Asks the OS to map the dynamic library at `path`. Leaves the caller
    /// with an error (not a partially-valid `Module`) on failure.
    pub fn load(path: &str) -> Result<Module, ModuleResolverError> {
        let handle = os::open(path)?;
        tracing::debug!(path, "module loaded");
        Ok(Module {
            handle,
            path: path.to_string(),
        })
    }

    /// True while the OS handle is non-null, i.e. between a successful
    /// [`Module::load`] and [`Module::unload`].
    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }

    /// Resolves `symbol` to an untyped function pointer, or `None` if the
    /// module has no such export. Returns `None` rather than erroring:
    /// a missing symbol is an expected, handled case for
    /// [`crate::DispatchTable::populate`]'s stub-on-miss policy, not a
    /// caller bug.
    pub fn resolve(&self, symbol: &str) -> Option<*const c_void> {
        if !self.is_valid() {
            return None;
        }
        os::resolve(self.handle, symbol)
    }

    /// Releases the OS reference. Idempotent; safe to call more than once.
    pub fn unload(&mut self) {
        if !self.handle.is_null() {
            os::close(self.handle);
            tracing::debug!(path = %self.path, "module unloaded");
            self.handle = std::ptr::null_mut();
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use std::ffi::{CStr, CString};

    pub fn open(path: &str) -> Result<*mut c_void, ModuleResolverError> {
        let cpath = CString::new(path)
            .map_err(|_| ModuleResolverError::InvalidArgs("path contains an interior NUL"))?;
        // SAFETY: `cpath` is a valid, NUL-terminated C string for the
        // duration of this call.
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(ModuleResolverError::OsFailure(last_dlerror()));
        }
        Ok(handle)
    }

    pub fn resolve(handle: *mut c_void, symbol: &str) -> Option<*const c_void> {
        let csym = CString::new(symbol).ok()?;
        // Clear any pending error so a null result is unambiguous.
        // SAFETY: dlerror with no arguments is always safe to call.
        unsafe { libc::dlerror() };
        // SAFETY: `handle` came from a successful `dlopen`, `csym` is a
        // valid C string for the call's duration.
        let sym = unsafe { libc::dlsym(handle, csym.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(sym as *const c_void)
        }
    }

    pub fn close(handle: *mut c_void) {
        // SAFETY: `handle` came from a successful `dlopen` and has not been
        // closed yet.
        unsafe {
            libc::dlclose(handle);
        }
    }

    fn last_dlerror() -> String {
        // SAFETY: dlerror's return value, if non-null, is a valid C string
        // owned by libc until the next dl* call on this thread.
        unsafe {
            let msg = libc::dlerror();
            if msg.is_null() {
                "dlopen failed".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::LibraryLoader::{
        FreeLibrary, GetProcAddress, LoadLibraryW,
    };

    pub fn open(path: &str) -> Result<*mut c_void, ModuleResolverError> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
        // SAFETY: `wide` is a valid, NUL-terminated UTF-16 string for the
        // duration of this call.
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            // SAFETY: GetLastError has no preconditions.
            let code = unsafe { GetLastError() };
            return Err(ModuleResolverError::OsFailure(format!(
                "LoadLibraryW failed, error {code}"
            )));
        }
        Ok(handle as *mut c_void)
    }

    pub fn resolve(handle: *mut c_void, symbol: &str) -> Option<*const c_void> {
        let csym = std::ffi::CString::new(symbol).ok()?;
        // SAFETY: `handle` came from a successful `LoadLibraryW`, `csym` is
        // a valid C string for the call's duration.
        let addr = unsafe { GetProcAddress(handle as _, csym.as_ptr() as *const u8) };
        addr.map(|f| f as *const c_void)
    }

    pub fn close(handle: *mut c_void) {
        // SAFETY: `handle` came from a successful `LoadLibraryW` and has not
        // been freed yet.
        unsafe {
            FreeLibrary(handle as _);
        }
    }
}

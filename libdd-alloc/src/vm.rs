// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw virtual-memory primitives: reserve a range of address space without
//! backing it with physical pages, commit/decommit sub-ranges of it, and
//! release the whole reservation. Every function here operates on whole
//! pages; callers are responsible for rounding.

use crate::{AllocError, Protection};
use core::ptr::NonNull;

/// Returns the OS page size. This is assumed not to change at runtime, so
/// callers may cache it.
#[cfg_attr(debug_assertions, track_caller)]
pub fn page_size() -> Result<usize, AllocError> {
    os::page_size()
}

/// Reserves `size` bytes of address space without committing any of it.
/// `size` must be a non-zero multiple of the page size. The returned range
/// has no read/write/execute access until [`commit`] is called on it.
pub fn reserve(size: usize) -> Result<NonNull<u8>, AllocError> {
    if size == 0 {
        return Err(AllocError);
    }
    os::reserve(size)
}

/// Commits `len` bytes starting at `base` (which must lie within a prior
/// [`reserve`] call of at least that size) with the given protection.
///
/// # Safety
/// `base` must point into a live reservation returned by [`reserve`], and
/// `[base, base+len)` must lie entirely within it.
pub unsafe fn commit(base: NonNull<u8>, len: usize, prot: Protection) -> Result<(), AllocError> {
    if len == 0 {
        return Err(AllocError);
    }
    os::commit(base, len, prot)
}

/// Decommits `len` bytes starting at `base`, returning the physical pages to
/// the OS while keeping the address range reserved.
///
/// # Safety
/// Same preconditions as [`commit`]. Callers must not touch the range again
/// until it is recommitted.
pub unsafe fn decommit(base: NonNull<u8>, len: usize) -> Result<(), AllocError> {
    if len == 0 {
        return Err(AllocError);
    }
    os::decommit(base, len)
}

/// Releases an entire reservation previously returned by [`reserve`].
///
/// # Safety
/// `base` and `reserved_len` must exactly match a prior [`reserve`] call;
/// partial releases are not supported by the underlying platform APIs.
pub unsafe fn release(base: NonNull<u8>, reserved_len: usize) -> Result<(), AllocError> {
    os::release(base, reserved_len)
}

#[cfg(unix)]
mod os {
    use super::*;
    use core::ffi::c_void;

    pub fn page_size() -> Result<usize, AllocError> {
        // SAFETY: sysconf with a well-known, always-valid name.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result <= 0 {
            return Err(AllocError);
        }
        let size = result as usize;
        if !size.is_power_of_two() {
            return Err(AllocError);
        }
        Ok(size)
    }

    pub fn reserve(size: usize) -> Result<NonNull<u8>, AllocError> {
        // PROT_NONE + MAP_PRIVATE|MAP_ANON gives us address space with no
        // backing pages; we commit sub-ranges later via mprotect.
        // SAFETY: fixed, well-formed arguments; no existing mapping is
        // disturbed because no address hint is given.
        let result = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if result == libc::MAP_FAILED {
            return Err(AllocError);
        }
        // SAFETY: mmap without MAP_FIXED never returns null on success.
        Ok(unsafe { NonNull::new_unchecked(result.cast()) })
    }

    pub unsafe fn commit(base: NonNull<u8>, len: usize, prot: Protection) -> Result<(), AllocError> {
        let native_prot = match prot {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::NoAccess => libc::PROT_NONE,
        };
        // SAFETY: caller guarantees the range lies within a live reservation.
        let result = libc::mprotect(base.as_ptr() as *mut c_void, len, native_prot);
        if result != 0 {
            return Err(AllocError);
        }
        Ok(())
    }

    pub unsafe fn decommit(base: NonNull<u8>, len: usize) -> Result<(), AllocError> {
        // MADV_DONTNEED releases the physical pages; mprotect(NONE) then
        // ensures any stray access faults instead of silently succeeding.
        // SAFETY: caller guarantees the range lies within a live reservation.
        let advised = libc::madvise(base.as_ptr() as *mut c_void, len, libc::MADV_DONTNEED);
        if advised != 0 {
            return Err(AllocError);
        }
        commit(base, len, Protection::NoAccess)
    }

    pub unsafe fn release(base: NonNull<u8>, reserved_len: usize) -> Result<(), AllocError> {
        // SAFETY: caller guarantees this matches a prior reserve() call.
        let result = libc::munmap(base.as_ptr() as *mut c_void, reserved_len);
        if result != 0 {
            return Err(AllocError);
        }
        Ok(())
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
        MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub fn page_size() -> Result<usize, AllocError> {
        // SAFETY: `info` is fully initialized by GetSystemInfo before use.
        let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        let size = info.dwPageSize as usize;
        if size == 0 || !size.is_power_of_two() {
            return Err(AllocError);
        }
        Ok(size)
    }

    pub fn reserve(size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: well-formed arguments to VirtualAlloc; no address hint, so
        // no existing mapping is disturbed.
        let result = unsafe {
            VirtualAlloc(core::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS)
        };
        NonNull::new(result.cast()).ok_or(AllocError)
    }

    pub unsafe fn commit(base: NonNull<u8>, len: usize, prot: Protection) -> Result<(), AllocError> {
        let native_prot = match prot {
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::NoAccess => PAGE_NOACCESS,
        };
        // SAFETY: caller guarantees the range lies within a live reservation.
        let result = VirtualAlloc(base.as_ptr().cast(), len, MEM_COMMIT, native_prot);
        if result.is_null() {
            return Err(AllocError);
        }
        Ok(())
    }

    pub unsafe fn decommit(base: NonNull<u8>, len: usize) -> Result<(), AllocError> {
        // SAFETY: caller guarantees the range lies within a live reservation.
        let result = VirtualFree(base.as_ptr().cast(), len, MEM_DECOMMIT);
        if result == 0 {
            return Err(AllocError);
        }
        Ok(())
    }

    pub unsafe fn release(base: NonNull<u8>, _reserved_len: usize) -> Result<(), AllocError> {
        // SAFETY: MEM_RELEASE requires size 0 and the original base address.
        let result = VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE);
        if result == 0 {
            return Err(AllocError);
        }
        Ok(())
    }

    // `VirtualProtect` is kept available for callers who want to reprotect a
    // committed range without decommitting it; unused internally today.
    #[allow(dead_code)]
    pub unsafe fn reprotect(base: NonNull<u8>, len: usize, prot: Protection) -> Result<(), AllocError> {
        let native_prot = match prot {
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::NoAccess => PAGE_NOACCESS,
        };
        let mut old = 0u32;
        let result = VirtualProtect(base.as_ptr().cast(), len, native_prot, &mut old);
        if result == 0 {
            return Err(AllocError);
        }
        Ok(())
    }
}

// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::StringTableError;
use libdd_alloc::{vm, Protection};
use std::cell::Cell;
use std::ptr::NonNull;

/// A single reserved range of address space with a growable committed
/// prefix. Used for the table's descriptor array, bucket-chunk pool, bucket
/// heads, and string-data block: each is an independently growable committed
/// array, not a sequence of distinct sub-allocations, so this crate talks to
/// `libdd_alloc::vm` directly rather than going through `libdd-arena`.
pub(crate) struct RawBuffer {
    base: NonNull<u8>,
    reserved_bytes: usize,
    committed_bytes: Cell<usize>,
}

impl RawBuffer {
    /// Reserves `reserved_bytes` of address space and commits the first
    /// `initial_commit_bytes` of it.
    pub fn new(reserved_bytes: usize, initial_commit_bytes: usize) -> Result<Self, StringTableError> {
        debug_assert!(initial_commit_bytes <= reserved_bytes);
        let base = vm::reserve(reserved_bytes).map_err(|_| StringTableError::OutOfMemory)?;
        if initial_commit_bytes > 0 {
            // SAFETY: `initial_commit_bytes <= reserved_bytes`, so this
            // range lies entirely within the reservation just made.
            if let Err(_err) = unsafe { vm::commit(base, initial_commit_bytes, Protection::ReadWrite) } {
                // SAFETY: `base`/`reserved_bytes` exactly match the
                // reservation above.
                unsafe { vm::release(base, reserved_bytes).ok() };
                return Err(StringTableError::OutOfMemory);
            }
        }
        Ok(RawBuffer {
            base,
            reserved_bytes,
            committed_bytes: Cell::new(initial_commit_bytes),
        })
    }

    /// Grows committed bytes to the smallest multiple of `chunk_bytes` that
    /// is `>= need_bytes`, capped at the reservation. Idempotent when
    /// already sufficient.
    pub fn ensure(&self, need_bytes: usize, chunk_bytes: usize) -> Result<(), StringTableError> {
        if need_bytes <= self.committed_bytes.get() {
            return Ok(());
        }
        if need_bytes > self.reserved_bytes {
            return Err(StringTableError::OutOfMemory);
        }
        let chunk = chunk_bytes.max(1);
        let new_committed = round_up(need_bytes, chunk).min(self.reserved_bytes);
        if new_committed < need_bytes {
            return Err(StringTableError::OutOfMemory);
        }
        let grow_len = new_committed - self.committed_bytes.get();
        // SAFETY: `base + committed_bytes` lies within the reservation, and
        // `grow_len` keeps the newly committed range within `reserved_bytes`.
        let base = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.committed_bytes.get())) };
        unsafe { vm::commit(base, grow_len, Protection::ReadWrite) }
            .map_err(|_| StringTableError::OutOfMemory)?;
        self.committed_bytes.set(new_committed);
        Ok(())
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes.get()
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        // SAFETY: `base`/`reserved_bytes` match the reservation made in
        // `new`, and this runs at most once.
        unsafe { vm::release(self.base, self.reserved_bytes).ok() };
    }
}

fn round_up(num: usize, multiple: usize) -> usize {
    debug_assert!(multiple > 0);
    let rem = num % multiple;
    if rem == 0 {
        num
    } else {
        num + (multiple - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_commit_and_grow() {
        let page = vm::page_size().unwrap();
        let buf = RawBuffer::new(page * 8, page).unwrap();
        assert_eq!(page, buf.committed_bytes());
        buf.ensure(page * 3, page).unwrap();
        assert_eq!(page * 3, buf.committed_bytes());
        buf.ensure(page * 2, page).unwrap();
        assert_eq!(page * 3, buf.committed_bytes());
    }

    #[test]
    fn test_ensure_beyond_reservation_fails() {
        let page = vm::page_size().unwrap();
        let buf = RawBuffer::new(page * 2, page).unwrap();
        assert!(buf.ensure(page * 10, page).is_err());
    }
}

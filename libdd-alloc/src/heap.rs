// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aligned heap allocation, for arenas backed by the system heap rather than
//! a dedicated virtual-memory reservation (small, short-lived arenas where a
//! full OS reservation would be overkill).

use crate::AllocError;
use core::alloc::Layout;
use core::ptr::NonNull;

/// Allocates `layout` from the system allocator. The returned memory is
/// uninitialized.
pub fn alloc_aligned(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    if layout.size() == 0 {
        return Err(AllocError);
    }
    // SAFETY: layout has non-zero size, as required by `std::alloc::alloc`.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or(AllocError)
}

/// Frees memory previously returned by [`alloc_aligned`] with the same
/// layout.
///
/// # Safety
/// `ptr` must have been returned by [`alloc_aligned`] with the exact same
/// `layout`, and must not be used again afterwards.
pub unsafe fn dealloc_aligned(ptr: NonNull<u8>, layout: Layout) {
    std::alloc::dealloc(ptr.as_ptr(), layout);
}

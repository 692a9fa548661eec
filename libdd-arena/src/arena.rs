// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ArenaError;
use crate::spec::{AllocatorType, ArenaKind, ArenaSpec, MemoryBlock};
use libdd_alloc::{heap, vm, Protection};
use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// The minimum commit-growth step: 128 KiB, per `spec.md` §4.1.
pub const DEFAULT_GROWTH_STEP: usize = 128 * 1024;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// A reservation-based linear allocator. Allocations are monotonic; only
/// [`Arena::reset_to_marker`] or [`Arena::reset`] reclaim space, and neither
/// decommits memory.
///
/// Arenas are not `Sync`: `next_offset`/`committed` are plain `Cell`s, since
/// the core is single-threaded and synchronous by design (`spec.md` §5).
pub struct Arena {
    id: u64,
    name: String,
    host_address: NonNull<u8>,
    reserved: usize,
    committed: Cell<usize>,
    next_offset: Cell<usize>,
    allocator_type: AllocatorType,
    tag: crate::spec::Fourcc,
    alloc_flags: crate::spec::AllocFlags,
    protection: Protection,
    owns_reservation: bool,
    can_grow: bool,
    heap_layout: Option<Layout>,
}

/// A snapshot of an arena's `next_offset`, capturable with [`Arena::mark`]
/// and rewound to with [`Arena::reset_to_marker`].
#[derive(Clone, Copy, Debug)]
pub struct Marker {
    arena_id: u64,
    offset: usize,
}

impl Arena {
    /// Creates a new arena per `spec`. See `spec.md` §4.1 for the exact
    /// validation rules.
    pub fn create(spec: ArenaSpec) -> Result<Self, ArenaError> {
        if spec.reserve_size == 0 || spec.commit_size == 0 {
            return Err(ArenaError::InvalidArgs(
                "reserve_size and commit_size must both be non-zero",
            ));
        }
        if spec.reserve_size < spec.commit_size {
            return Err(ArenaError::InvalidArgs(
                "reserve_size must be >= commit_size",
            ));
        }
        if matches!(spec.kind, ArenaKind::Internal) && spec.allocator_type == AllocatorType::Device
        {
            return Err(ArenaError::InvalidArgs(
                "an internal arena cannot back a Device allocator type",
            ));
        }

        let id = NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed);

        let (host_address, reserved, committed, owns_reservation, can_grow, heap_layout) =
            match spec.kind {
                ArenaKind::Internal => Self::create_internal(&spec)?,
                ArenaKind::External { host_buffer } => {
                    let buffer = host_buffer.ok_or(ArenaError::InvalidArgs(
                        "external arena of a host allocator type requires a non-null host buffer",
                    ))?;
                    // An external arena wraps the caller's region verbatim
                    // (`spec.md` §4.1): it was not produced by `vm::reserve`,
                    // so this crate has no standing to `mprotect`/`VirtualAlloc`
                    // over it. Treat the whole buffer as already committed and
                    // never grow it.
                    (buffer, spec.reserve_size, spec.reserve_size, false, false, None)
                }
            };

        tracing::debug!(
            arena = spec.name.as_str(),
            id,
            reserved,
            committed,
            "arena created"
        );

        Ok(Arena {
            id,
            name: spec.name,
            host_address,
            reserved,
            committed: Cell::new(committed),
            next_offset: Cell::new(0),
            allocator_type: spec.allocator_type,
            tag: spec.tag,
            alloc_flags: spec.alloc_flags,
            protection: spec.protection,
            owns_reservation,
            can_grow,
            heap_layout,
        })
    }

    #[allow(clippy::type_complexity)]
    fn create_internal(
        spec: &ArenaSpec,
    ) -> Result<(NonNull<u8>, usize, usize, bool, bool, Option<Layout>), ArenaError> {
        match spec.allocator_type {
            AllocatorType::HostHeap => {
                let layout = Layout::from_size_align(spec.commit_size, 16)
                    .map_err(|_| ArenaError::InvalidArgs("commit_size overflows a Layout"))?;
                let ptr = heap::alloc_aligned(layout).map_err(|_| ArenaError::OutOfMemory)?;
                Ok((ptr, spec.commit_size, spec.commit_size, true, false, Some(layout)))
            }
            AllocatorType::HostVmm => {
                let base = vm::reserve(spec.reserve_size).map_err(|_| ArenaError::OutOfMemory)?;
                // SAFETY: `base` was just reserved with at least commit_size
                // bytes available, per the reserve_size >= commit_size check
                // above.
                let committed = unsafe { vm::commit(base, spec.commit_size, spec.protection) };
                if committed.is_err() {
                    // SAFETY: `base`/`spec.reserve_size` exactly match the
                    // reservation just made.
                    unsafe { vm::release(base, spec.reserve_size).ok() };
                    return Err(ArenaError::OutOfMemory);
                }
                Ok((base, spec.reserve_size, spec.commit_size, true, true, None))
            }
            AllocatorType::Device => unreachable!("validated above"),
        }
    }

    /// Advances `next_offset` to the next multiple of `alignment` and
    /// returns a block of `size` bytes there, growing commitment if needed.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<MemoryBlock, ArenaError> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidArgs(
                "size must be non-zero and alignment must be a power of two",
            ));
        }

        let current = self.next_offset.get();
        let aligned = align_up(current, alignment).ok_or(ArenaError::OutOfMemory)?;
        let new_offset = aligned.checked_add(size).ok_or(ArenaError::OutOfMemory)?;

        if new_offset > self.reserved {
            return Err(ArenaError::OutOfMemory);
        }

        if new_offset > self.committed.get() {
            self.grow_commitment(new_offset)?;
        }

        self.next_offset.set(new_offset);

        // SAFETY: `aligned` is within `[0, reserved)` and the range up to
        // `new_offset` is now committed, per the checks above.
        let host_address = unsafe { NonNull::new_unchecked(self.host_address.as_ptr().add(aligned)) };

        Ok(MemoryBlock {
            host_address,
            bytes_committed: size,
            bytes_reserved: size,
            block_offset: aligned,
            allocator_type: self.allocator_type,
            allocation_flags: self.alloc_flags,
            allocator_tag: self.tag,
        })
    }

    fn grow_commitment(&self, need: usize) -> Result<(), ArenaError> {
        if !self.can_grow {
            return Err(ArenaError::OutOfMemory);
        }
        let shortfall = need - self.committed.get();
        let growth = DEFAULT_GROWTH_STEP.max(shortfall);
        let new_committed = self.reserved.min(self.committed.get() + growth);
        if new_committed < need {
            return Err(ArenaError::OutOfMemory);
        }

        let grow_len = new_committed - self.committed.get();
        // SAFETY: `host_address + committed` lies within the reservation,
        // and `grow_len` keeps the committed range within `reserved`.
        let base = unsafe {
            NonNull::new_unchecked(self.host_address.as_ptr().add(self.committed.get()))
        };
        unsafe { vm::commit(base, grow_len, self.protection) }.map_err(|_| ArenaError::OutOfMemory)?;

        tracing::debug!(
            arena = self.name.as_str(),
            id = self.id,
            new_committed,
            "arena grew commitment"
        );

        self.committed.set(new_committed);
        Ok(())
    }

    /// Captures the current `next_offset`.
    pub fn mark(&self) -> Marker {
        Marker {
            arena_id: self.id,
            offset: self.next_offset.get(),
        }
    }

    /// Rewinds `next_offset` to a previously captured marker. Does not
    /// decommit. Panics in debug builds if `marker` belongs to a different
    /// arena or is ahead of the current offset; no-ops in release builds.
    pub fn reset_to_marker(&self, marker: Marker) {
        debug_assert_eq!(
            marker.arena_id, self.id,
            "marker does not belong to this arena"
        );
        debug_assert!(
            marker.offset <= self.next_offset.get(),
            "marker is ahead of the current offset"
        );
        if marker.arena_id != self.id || marker.offset > self.next_offset.get() {
            return;
        }
        self.next_offset.set(marker.offset);
    }

    /// Sets `next_offset` back to zero. Does not decommit.
    pub fn reset(&self) {
        self.next_offset.set(0);
    }

    /// Bytes allocated since the last reset/marker rewind.
    pub fn used_bytes(&self) -> usize {
        self.next_offset.get()
    }

    /// Bytes currently committed (readable/writable).
    pub fn committed_bytes(&self) -> usize {
        self.committed.get()
    }

    /// Total bytes reserved for this arena.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.owns_reservation {
            return;
        }
        match self.allocator_type {
            AllocatorType::HostHeap => {
                if let Some(layout) = self.heap_layout {
                    // SAFETY: `host_address`/`layout` match the allocation
                    // made in `create_internal`, and this runs at most once.
                    unsafe { heap::dealloc_aligned(self.host_address, layout) };
                }
            }
            AllocatorType::HostVmm => {
                // SAFETY: `host_address`/`reserved` match the reservation
                // made in `create_internal`, and this runs at most once.
                unsafe { vm::release(self.host_address, self.reserved).ok() };
            }
            AllocatorType::Device => unreachable!("internal arenas never back Device"),
        }
    }
}

#[inline]
fn align_up(offset: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    offset.checked_add(mask).map(|v| v & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ArenaSpec;

    #[test]
    fn test_invalid_args_zero_sizes() {
        let spec = ArenaSpec::host_heap("t", 0);
        assert!(matches!(Arena::create(spec), Err(ArenaError::InvalidArgs(_))));
    }

    #[test]
    fn test_invalid_args_reserve_lt_commit() {
        let mut spec = ArenaSpec::host_vmm("t", 4096, 4096);
        spec.reserve_size = 1024;
        assert!(matches!(Arena::create(spec), Err(ArenaError::InvalidArgs(_))));
    }

    #[test]
    fn test_invalid_args_internal_device() {
        let mut spec = ArenaSpec::host_heap("t", 4096);
        spec.allocator_type = AllocatorType::Device;
        assert!(matches!(Arena::create(spec), Err(ArenaError::InvalidArgs(_))));
    }

    #[test]
    fn test_invalid_args_external_null_buffer() {
        let mut spec = ArenaSpec::host_vmm("t", 4096, 4096);
        spec.kind = ArenaKind::External { host_buffer: None };
        assert!(matches!(Arena::create(spec), Err(ArenaError::InvalidArgs(_))));
    }

    #[test]
    fn test_external_arena_never_grows_past_caller_buffer() {
        // A caller-owned buffer wrapped verbatim: the whole thing is
        // considered committed up front, and allocating past it fails
        // rather than calling into vm::commit on memory this crate does not
        // own.
        let mut backing = vec![0u8; 4096];
        let mut spec = ArenaSpec::host_vmm("t", backing.len(), 64);
        spec.kind = ArenaKind::External {
            host_buffer: NonNull::new(backing.as_mut_ptr()),
        };
        let arena = Arena::create(spec).unwrap();
        assert_eq!(backing.len(), arena.committed_bytes());
        assert!(arena.allocate(4096, 1).is_ok());
        assert!(matches!(arena.allocate(1, 1), Err(ArenaError::OutOfMemory)));
    }

    #[test]
    fn test_heap_arena_basic_allocate() {
        let arena = Arena::create(ArenaSpec::host_heap("t", 4096)).unwrap();
        let a = arena.allocate(8, 8).unwrap();
        let b = arena.allocate(8, 8).unwrap();
        assert_ne!(a.host_address, b.host_address);
        assert_eq!(8, arena.used_bytes() - 8);
    }

    #[test]
    fn test_mark_reset_to_marker_restores_address() {
        let arena = Arena::create(ArenaSpec::host_vmm("t", 1024 * 1024, 64 * 1024)).unwrap();
        let marker = arena.mark();
        let first = arena.allocate(4096, 16).unwrap();
        arena.allocate(4096, 16).unwrap();
        arena.reset_to_marker(marker);
        let after = arena.allocate(4096, 16).unwrap();
        assert_eq!(first.host_address, after.host_address);
    }

    #[test]
    fn test_reset_to_zero() {
        let arena = Arena::create(ArenaSpec::host_heap("t", 4096)).unwrap();
        let first = arena.allocate(16, 16).unwrap();
        arena.allocate(16, 16).unwrap();
        arena.reset();
        let after = arena.allocate(16, 16).unwrap();
        assert_eq!(first.host_address, after.host_address);
    }

    #[test]
    fn test_vmm_commit_growth_s6() {
        // S6: VMM arena with 64 KiB initial commit, mark, allocate 1 MiB
        // (forcing commit growth), reset to marker.
        let arena = Arena::create(ArenaSpec::host_vmm("t", 8 * 1024 * 1024, 64 * 1024)).unwrap();
        let before_commit = arena.committed_bytes();
        assert_eq!(64 * 1024, before_commit);
        let marker = arena.mark();
        let first = arena.allocate(1024 * 1024, 16).unwrap();
        assert!(arena.committed_bytes() > before_commit);
        let committed_after_growth = arena.committed_bytes();
        arena.reset_to_marker(marker);
        let after = arena.allocate(1024 * 1024, 16).unwrap();
        assert_eq!(first.host_address, after.host_address);
        // Commitment does not shrink on rewind.
        assert_eq!(committed_after_growth, arena.committed_bytes());
    }

    #[test]
    fn test_heap_arena_out_of_memory_does_not_grow() {
        let arena = Arena::create(ArenaSpec::host_heap("t", 64)).unwrap();
        arena.allocate(32, 8).unwrap();
        let err = arena.allocate(64, 8).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory));
    }
}

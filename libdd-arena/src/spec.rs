// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_alloc::Protection;
use std::ptr::NonNull;

/// The backing allocator an arena draws its memory from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocatorType {
    /// A single fixed-size allocation from the system heap.
    HostHeap,
    /// A reserve/commit-on-demand OS virtual-memory region.
    HostVmm,
    /// Memory owned by a non-host allocator (e.g. a GPU upload heap). The
    /// core never allocates this itself; such arenas must be `External`.
    Device,
}

/// A FOURCC-style 32-bit tag, as used to mark which allocator produced a
/// given [`crate::MemoryBlock`].
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    /// Builds a tag from four ASCII bytes, in the conventional little-endian
    /// FOURCC packing (`bytes[0]` in the low byte).
    pub const fn new(bytes: [u8; 4]) -> Self {
        Fourcc(u32::from_le_bytes(bytes))
    }
}

impl std::fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_le_bytes();
        match std::str::from_utf8(&bytes) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic() || c == ' ') => {
                write!(f, "Fourcc({s:?})")
            }
            _ => write!(f, "Fourcc(0x{:08x})", self.0),
        }
    }
}

/// Opaque caller-defined allocation flags, carried verbatim into every
/// [`crate::MemoryBlock`] produced by the arena. The core does not interpret
/// these bits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocFlags(pub u32);

/// Whether an arena owns its backing reservation (`Internal`) or borrows a
/// caller-provided buffer (`External`).
///
/// `spec.md` models this as two independent flag bits and calls setting both
/// simultaneously an `InvalidArgs` error; here the choice is instead modeled
/// as an enum so that state is unrepresentable by construction. See
/// `DESIGN.md` for the corresponding open-question resolution.
#[derive(Clone, Copy, Debug)]
pub enum ArenaKind {
    /// The arena allocates and owns its own reservation; `Delete` releases
    /// it.
    Internal,
    /// The arena borrows memory the caller already owns; `Delete` is a
    /// no-op on the underlying buffer.
    External {
        /// The first byte of the caller-owned region. Required for
        /// `HostHeap`/`HostVmm` allocator types; may be absent for `Device`
        /// arenas whose backing isn't host-addressable.
        host_buffer: Option<NonNull<u8>>,
    },
}

/// Describes how to create an [`crate::Arena`].
#[derive(Clone, Debug)]
pub struct ArenaSpec {
    /// A human-readable label, surfaced in tracing events only.
    pub name: String,
    /// Total address space to reserve (for `HostVmm`) or the size of the
    /// caller's buffer (for `External`).
    pub reserve_size: usize,
    /// Bytes committed (readable/writable) up front.
    pub commit_size: usize,
    pub allocator_type: AllocatorType,
    pub tag: Fourcc,
    pub alloc_flags: AllocFlags,
    pub kind: ArenaKind,
    /// Protection requested for committed pages of a `HostVmm` arena.
    /// Ignored for other allocator types.
    pub protection: Protection,
}

impl ArenaSpec {
    /// A spec for an internal, heap-backed arena of exactly `size` bytes.
    pub fn host_heap(name: impl Into<String>, size: usize) -> Self {
        ArenaSpec {
            name: name.into(),
            reserve_size: size,
            commit_size: size,
            allocator_type: AllocatorType::HostHeap,
            tag: Fourcc(0),
            alloc_flags: AllocFlags::default(),
            kind: ArenaKind::Internal,
            protection: Protection::ReadWrite,
        }
    }

    /// A spec for an internal, VM-backed arena that reserves `reserve_size`
    /// bytes and commits `commit_size` of them up front, growing on demand.
    pub fn host_vmm(name: impl Into<String>, reserve_size: usize, commit_size: usize) -> Self {
        ArenaSpec {
            name: name.into(),
            reserve_size,
            commit_size,
            allocator_type: AllocatorType::HostVmm,
            tag: Fourcc(0),
            alloc_flags: AllocFlags::default(),
            kind: ArenaKind::Internal,
            protection: Protection::ReadWrite,
        }
    }

    pub fn with_tag(mut self, tag: Fourcc) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.alloc_flags = flags;
        self
    }
}

/// Descriptor returned by arena (and, transitively, heap/VMM) allocations.
/// A plain value type: its lifetime is tied to the arena it came from, not
/// to the descriptor itself.
#[derive(Clone, Copy, Debug)]
pub struct MemoryBlock {
    pub host_address: NonNull<u8>,
    pub bytes_committed: usize,
    pub bytes_reserved: usize,
    pub block_offset: usize,
    pub allocator_type: AllocatorType,
    pub allocation_flags: AllocFlags,
    pub allocator_tag: Fourcc,
}

impl MemoryBlock {
    /// A block is valid iff either byte-count is non-zero.
    pub fn is_valid(&self) -> bool {
        self.bytes_committed != 0 || self.bytes_reserved != 0
    }
}

// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity hash-chunk records: `spec.md` §3 "buckets". Each bucket
//! head is a chunk index into a shared pool; chunks chain via `next` to
//! hold more than 30 entries per bucket.

/// Entries per chunk (`spec.md` §3/§4.3).
pub(crate) const CHUNK_CAPACITY: usize = 30;

/// Sentinel meaning "no chunk" (a bucket with no entries yet) or "end of
/// chain" (a chunk's `next`).
pub(crate) const NONE: u32 = u32::MAX;

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct ChunkEntry {
    pub hash32: u32,
    pub string_slot: u32,
}

/// One node of a bucket's hash chain. `entries[0..count)` are in use;
/// `entries[count..]` are unspecified (zeroed, since chunk-pool commitment
/// is fresh OS memory) but never read. All-`u32` fields, no padding, so
/// reading/writing the whole record by value is well defined regardless of
/// which entries have been written yet.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct ChunkRecord {
    pub entries: [ChunkEntry; CHUNK_CAPACITY],
    pub next: u32,
    pub count: u32,
}

pub(crate) const CHUNK_RECORD_SIZE: usize = std::mem::size_of::<ChunkRecord>();

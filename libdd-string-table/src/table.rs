// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::chunk::{ChunkEntry, ChunkRecord, CHUNK_CAPACITY, CHUNK_RECORD_SIZE, NONE};
use crate::error::StringTableError;
use crate::hash::{hash_bytes, StringHash};
use crate::raw_buffer::RawBuffer;
use crate::spec::{CharType, StringDescriptor, StringHandle, StringTableInfo, StringTableSpec};
use std::cell::Cell;

const DESCRIPTOR_SIZE: usize = std::mem::size_of::<StringDescriptor>();

/// Fixed growth step for the descriptor array and the bucket-chunk pool,
/// per `spec.md` §4.3 ("grow descriptor commitment ... by a fixed 64 KiB
/// grow step", "committing more chunks 64 KiB at a time"). The data block's
/// growth step is not separately specified; this implementation reuses the
/// same 64 KiB step for it.
const GROW_STEP_BYTES: usize = 64 * 1024;

/// An append-only, partially-committed string-interning table. Strings of
/// mixed UTF-8/16/32 encoding are deduplicated via a chained hash index
/// (`spec.md` §3/§4.3); identical bytes under the same [`CharType`] always
/// return the same [`StringHandle`].
///
/// Any [`StringHandle`]/slice this table hands out is invalidated by the
/// next mutating call (`intern_*`, `rebuild_from`, `reset`).
pub struct StringTable {
    data: RawBuffer,
    descriptors: RawBuffer,
    buckets: RawBuffer,
    chunk_pool: RawBuffer,
    bucket_count: usize,
    max_chunks: usize,
    max_strings: usize,
    max_data_bytes: usize,
    data_next: Cell<usize>,
    string_count: Cell<usize>,
    descriptor_commit: Cell<usize>,
    chunk_commit: Cell<usize>,
    chunk_free_head: Cell<u32>,
    chunk_high_watermark: Cell<u32>,
}

impl StringTable {
    /// Creates a table per `spec`. Bucket count is the smallest power of
    /// two `>= ceil(max_strings / 30)`. Descriptor array, chunk pool, and
    /// data block are reserved for their respective worst cases and
    /// partially committed; the bucket-head array is committed in full
    /// since it's small and always fully addressed.
    pub fn create(spec: StringTableSpec) -> Result<StringTable, StringTableError> {
        if spec.max_strings == 0 {
            return Err(StringTableError::InvalidArgs("max_strings must be non-zero"));
        }
        if spec.max_data_bytes == 0 {
            return Err(StringTableError::InvalidArgs("max_data_bytes must be non-zero"));
        }
        if spec.initial_strings > spec.max_strings {
            return Err(StringTableError::InvalidArgs(
                "initial_strings must not exceed max_strings",
            ));
        }
        if spec.initial_data_commit > spec.max_data_bytes {
            return Err(StringTableError::InvalidArgs(
                "initial_data_commit must not exceed max_data_bytes",
            ));
        }

        let bucket_count = next_pow2(div_ceil(spec.max_strings, CHUNK_CAPACITY).max(1));
        let max_chunks = spec.max_strings;

        let descriptors_reserved = spec
            .max_strings
            .checked_mul(DESCRIPTOR_SIZE)
            .ok_or(StringTableError::InvalidArgs("max_strings overflows descriptor reservation"))?;
        let descriptors = RawBuffer::new(descriptors_reserved, spec.initial_strings * DESCRIPTOR_SIZE)?;

        let data = RawBuffer::new(spec.max_data_bytes, spec.initial_data_commit)?;

        let buckets = RawBuffer::new(bucket_count * 4, bucket_count * 4)?;
        // SAFETY: `buckets` is committed in full for `bucket_count` u32
        // words; NONE is all-ones, so a byte-fill is equivalent to writing
        // NONE to every head.
        unsafe { std::ptr::write_bytes(buckets.as_ptr(), 0xFF, bucket_count * 4) };

        let chunk_pool_reserved = max_chunks
            .checked_mul(CHUNK_RECORD_SIZE)
            .ok_or(StringTableError::InvalidArgs("max_strings overflows chunk-pool reservation"))?;
        let chunk_pool = RawBuffer::new(chunk_pool_reserved, 0)?;

        tracing::debug!(
            max_strings = spec.max_strings,
            max_data_bytes = spec.max_data_bytes,
            bucket_count,
            "string table created"
        );

        Ok(StringTable {
            data,
            descriptors,
            buckets,
            chunk_pool,
            bucket_count,
            max_chunks,
            max_strings: spec.max_strings,
            max_data_bytes: spec.max_data_bytes,
            data_next: Cell::new(0),
            string_count: Cell::new(0),
            descriptor_commit: Cell::new(spec.initial_strings),
            chunk_commit: Cell::new(0),
            chunk_free_head: Cell::new(NONE),
            chunk_high_watermark: Cell::new(0),
        })
    }

    /// Interns a UTF-8 string (its bytes, without a NUL terminator — one is
    /// appended internally). Returns the same handle for repeated interns
    /// of identical bytes.
    pub fn intern_utf8(&self, s: &str) -> Result<StringHandle, StringTableError> {
        let hash = crate::hash::hash_utf8(s.as_bytes());
        self.intern_raw(s.as_bytes(), CharType::Utf8, hash)
    }

    /// Interns a UTF-16 code-unit sequence, without a NUL terminator.
    pub fn intern_utf16(&self, units: &[u16]) -> Result<StringHandle, StringTableError> {
        let hash = crate::hash::hash_utf16(units);
        let bytes = le_bytes_of(units, |u| u.to_le_bytes());
        self.intern_raw(&bytes, CharType::Utf16, hash)
    }

    /// Interns a UTF-32 code-unit sequence, without a NUL terminator.
    pub fn intern_utf32(&self, units: &[u32]) -> Result<StringHandle, StringTableError> {
        let hash = crate::hash::hash_utf32(units);
        let bytes = le_bytes_of(units, |u| u.to_le_bytes());
        self.intern_raw(&bytes, CharType::Utf32, hash)
    }

    fn intern_raw(
        &self,
        content: &[u8],
        char_type: CharType,
        hash: StringHash,
    ) -> Result<StringHandle, StringTableError> {
        let bucket_idx = (hash.hash32 as usize) & (self.bucket_count - 1);
        if let Some(existing) = self.lookup(bucket_idx, hash.hash32, content, char_type) {
            return Ok(existing);
        }
        self.insert_new(bucket_idx, content, char_type, hash)
    }

    fn lookup(&self, bucket_idx: usize, hash32: u32, content: &[u8], char_type: CharType) -> Option<StringHandle> {
        let nul_bytes = char_type.nul_unit_bytes();
        let total_len = content.len() + nul_bytes;
        let mut chunk_idx = self.bucket_head(bucket_idx);
        while chunk_idx != NONE {
            let chunk = self.chunk_get(chunk_idx as usize);
            for entry in &chunk.entries[..chunk.count as usize] {
                if entry.hash32 != hash32 {
                    continue;
                }
                let desc = self.descriptor_get(entry.string_slot as usize);
                if desc.char_type() == char_type
                    && desc.byte_length_with_nul as usize == total_len
                    && self.payload_bytes(desc.byte_offset as usize, content.len()) == content
                {
                    return Some(StringHandle(desc.byte_offset));
                }
            }
            chunk_idx = chunk.next;
        }
        None
    }

    fn insert_new(
        &self,
        bucket_idx: usize,
        content: &[u8],
        char_type: CharType,
        hash: StringHash,
    ) -> Result<StringHandle, StringTableError> {
        let slot = self.string_count.get();
        if slot >= self.max_strings {
            return Err(StringTableError::OutOfMemory);
        }
        self.ensure_descriptor_commit(slot + 1)?;

        let nul_bytes = char_type.nul_unit_bytes();
        let total_payload = content.len() + nul_bytes;
        let pad = (4 - (total_payload % 4)) % 4;
        let entry_len = 4 + total_payload + pad;
        let start = self.data_next.get();
        let needed = start
            .checked_add(entry_len)
            .ok_or(StringTableError::OutOfMemory)?;
        if needed > self.max_data_bytes {
            return Err(StringTableError::OutOfMemory);
        }
        self.ensure_data_commit(needed)?;

        // Reserve room for this string's bucket entry *before* writing any
        // payload bytes or advancing `data_next`/`string_count`: a chunk-pool
        // OOM here must leave the table exactly as it was (`spec.md` §7), and
        // invariant (a) requires every string in `data` stay reachable
        // through exactly one bucket entry — never orphaned. Once this
        // succeeds, nothing below can fail.
        let chunk_idx = self.reserve_bucket_slot(bucket_idx)?;

        // SAFETY: `[start, start + entry_len)` lies within the data block's
        // committed range, per `ensure_data_commit` above, and the back-
        // index, content, and padding regions are disjoint non-overlapping
        // sub-ranges of it.
        unsafe {
            let base = self.data.as_ptr();
            write_u32(base, start, slot as u32);
            std::ptr::copy_nonoverlapping(content.as_ptr(), base.add(start + 4), content.len());
            std::ptr::write_bytes(base.add(start + 4 + content.len()), 0, nul_bytes + pad);
        }

        let byte_offset = (start + 4) as u32;
        self.descriptor_set(
            slot,
            StringDescriptor::new(byte_offset, total_payload as u32, hash.char_count as u32, char_type),
        );
        self.data_next.set(start + entry_len);
        self.string_count.set(slot + 1);

        self.commit_bucket_slot(chunk_idx, hash.hash32, slot as u32);
        Ok(StringHandle(byte_offset))
    }

    /// Reads the descriptor for a pointer-like handle previously returned
    /// by an `intern_*` call, by reading the 4-byte back-index stored
    /// immediately before its payload (`spec.md` §9).
    pub fn get_string_info(&self, handle: StringHandle) -> Result<StringDescriptor, StringTableError> {
        let offset = handle.0 as usize;
        if offset < 4 || offset > self.data_next.get() {
            return Err(StringTableError::NotFound);
        }
        // SAFETY: `offset >= 4` and `offset <= data_next <= committed_bytes`,
        // so the 4 bytes at `offset - 4` were written by a prior intern.
        let back_index = unsafe { read_u32(self.data.as_ptr(), offset - 4) };
        if back_index as usize >= self.string_count.get() {
            return Err(StringTableError::NotFound);
        }
        let descriptor = self.descriptor_get(back_index as usize);
        if descriptor.byte_offset != offset as u32 {
            return Err(StringTableError::NotFound);
        }
        Ok(descriptor)
    }

    /// A read-only snapshot of this table's storage, for serialization.
    pub fn table_info(&self) -> StringTableInfo<'_> {
        let count = self.string_count.get();
        let bytes = self.data_next.get();
        // SAFETY: `descriptors`/`data` are committed for at least `count`
        // descriptors and `bytes` bytes respectively.
        let descriptors = unsafe {
            std::slice::from_raw_parts(self.descriptors.as_ptr() as *const StringDescriptor, count)
        };
        let data = unsafe { std::slice::from_raw_parts(self.data.as_ptr(), bytes) };
        StringTableInfo {
            descriptors,
            data,
            count,
            bytes,
        }
    }

    /// Loads a previously serialized `(descriptors, data)` pair back into
    /// this table's storage and rebuilds the hash index by rehashing every
    /// string under the encoding recorded in its own descriptor — no
    /// dedup-by-lookup is repeated, since the input is assumed already
    /// deduplicated.
    pub fn rebuild_from(
        &mut self,
        descriptors: &[StringDescriptor],
        data: &[u8],
    ) -> Result<(), StringTableError> {
        if descriptors.len() > self.max_strings {
            return Err(StringTableError::InvalidArgs(
                "descriptors.len() exceeds max_strings",
            ));
        }
        if data.len() > self.max_data_bytes {
            return Err(StringTableError::InvalidArgs("data.len() exceeds max_data_bytes"));
        }

        self.ensure_descriptor_commit(descriptors.len())?;
        self.ensure_data_commit(data.len())?;

        // SAFETY: both destinations were just ensured to be committed for
        // at least the source length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                descriptors.as_ptr(),
                self.descriptors.as_ptr() as *mut StringDescriptor,
                descriptors.len(),
            );
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.data.as_ptr(), data.len());
        }
        self.string_count.set(descriptors.len());
        self.data_next.set(data.len());
        self.clear_hash_index();

        for (slot, descriptor) in descriptors.iter().enumerate() {
            let start = descriptor.byte_offset as usize;
            let len = descriptor.content_len();
            let payload = self.payload_bytes(start, len);
            let hash32 = hash_bytes(payload);
            let bucket_idx = (hash32 as usize) & (self.bucket_count - 1);
            self.insert_bucket_entry(bucket_idx, hash32, slot as u32)?;
        }

        tracing::debug!(count = descriptors.len(), bytes = data.len(), "string table rebuilt");
        Ok(())
    }

    /// Returns every chunk to the free list (functionally: resets the
    /// chunk-pool bump pointer, since nothing references old chunks once
    /// the index is cleared), zeroes the bucket heads, and resets
    /// `data_next`/`count` to zero. Does not decommit.
    pub fn reset(&self) {
        self.clear_hash_index();
        self.data_next.set(0);
        self.string_count.set(0);
        tracing::debug!("string table reset");
    }

    pub fn len(&self) -> usize {
        self.string_count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.string_count.get() == 0
    }

    pub fn data_bytes_used(&self) -> usize {
        self.data_next.get()
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    fn clear_hash_index(&self) {
        // SAFETY: `buckets` is committed in full for `bucket_count` u32
        // words; NONE is all-ones.
        unsafe { std::ptr::write_bytes(self.buckets.as_ptr(), 0xFF, self.bucket_count * 4) };
        self.chunk_free_head.set(NONE);
        self.chunk_high_watermark.set(0);
    }

    /// Ensures `buckets[bucket_idx]`'s chain has a chunk with room for one
    /// more entry — allocating and linking a fresh one if the head is
    /// missing or full — and returns that chunk's index. This is the only
    /// fallible half of inserting a bucket entry; callers write a string's
    /// payload/descriptor/counters only after this succeeds, so a chunk-pool
    /// `OutOfMemory` never leaves a string written with no bucket entry.
    fn reserve_bucket_slot(&self, bucket_idx: usize) -> Result<u32, StringTableError> {
        let head = self.bucket_head(bucket_idx);
        if head != NONE && (self.chunk_get(head as usize).count as usize) < CHUNK_CAPACITY {
            return Ok(head);
        }
        let idx = self.alloc_chunk()?;
        if head != NONE {
            self.chunk_set_next(idx, head);
        }
        self.set_bucket_head(bucket_idx, idx);
        Ok(idx)
    }

    /// Pushes `{hash32, string_slot}` into `chunk_idx`. Cannot fail: callers
    /// only reach this after a successful [`Self::reserve_bucket_slot`] on
    /// the same chunk guaranteed it has room.
    fn commit_bucket_slot(&self, chunk_idx: u32, hash32: u32, string_slot: u32) {
        self.chunk_push_entry(chunk_idx, hash32, string_slot);
    }

    fn insert_bucket_entry(&self, bucket_idx: usize, hash32: u32, slot: u32) -> Result<(), StringTableError> {
        let chunk_idx = self.reserve_bucket_slot(bucket_idx)?;
        self.commit_bucket_slot(chunk_idx, hash32, slot);
        Ok(())
    }

    fn alloc_chunk(&self) -> Result<u32, StringTableError> {
        let head = self.chunk_free_head.get();
        let idx = if head != NONE {
            let next_free = self.chunk_get(head as usize).next;
            self.chunk_free_head.set(next_free);
            head
        } else {
            let high = self.chunk_high_watermark.get();
            if high as usize >= self.max_chunks {
                return Err(StringTableError::OutOfMemory);
            }
            self.ensure_chunk_commit(high as usize + 1)?;
            self.chunk_high_watermark.set(high + 1);
            high
        };
        self.chunk_init(idx);
        Ok(idx)
    }

    fn ensure_descriptor_commit(&self, need: usize) -> Result<(), StringTableError> {
        if need <= self.descriptor_commit.get() {
            return Ok(());
        }
        let elements_per_step = (GROW_STEP_BYTES / DESCRIPTOR_SIZE).max(1);
        self.descriptors
            .ensure(need * DESCRIPTOR_SIZE, elements_per_step * DESCRIPTOR_SIZE)?;
        self.descriptor_commit.set(round_up(need, elements_per_step));
        Ok(())
    }

    fn ensure_data_commit(&self, need: usize) -> Result<(), StringTableError> {
        self.data.ensure(need, GROW_STEP_BYTES)
    }

    fn ensure_chunk_commit(&self, need: usize) -> Result<(), StringTableError> {
        if need <= self.chunk_commit.get() {
            return Ok(());
        }
        let chunks_per_step = (GROW_STEP_BYTES / CHUNK_RECORD_SIZE).max(1);
        self.chunk_pool
            .ensure(need * CHUNK_RECORD_SIZE, chunks_per_step * CHUNK_RECORD_SIZE)?;
        self.chunk_commit.set(round_up(need, chunks_per_step));
        Ok(())
    }

    #[inline]
    fn bucket_head(&self, idx: usize) -> u32 {
        debug_assert!(idx < self.bucket_count);
        // SAFETY: `buckets` is committed in full for `bucket_count` words.
        unsafe { *(self.buckets.as_ptr() as *const u32).add(idx) }
    }

    #[inline]
    fn set_bucket_head(&self, idx: usize, value: u32) {
        debug_assert!(idx < self.bucket_count);
        // SAFETY: same as `bucket_head`.
        unsafe { *(self.buckets.as_ptr() as *mut u32).add(idx) = value };
    }

    #[inline]
    fn chunk_ptr(&self, idx: usize) -> *mut ChunkRecord {
        debug_assert!(idx < self.chunk_commit.get());
        (self.chunk_pool.as_ptr() as *mut ChunkRecord).wrapping_add(idx)
    }

    #[inline]
    fn chunk_get(&self, idx: usize) -> ChunkRecord {
        // SAFETY: `idx < chunk_commit`, checked by every call site via
        // `chunk_ptr`'s debug assertion, and `ChunkRecord` has no padding.
        unsafe { *self.chunk_ptr(idx) }
    }

    fn chunk_init(&self, idx: u32) {
        // SAFETY: `idx` was just allocated (from the free list or a fresh
        // high-watermark bump, both already committed).
        unsafe {
            let ptr = self.chunk_ptr(idx as usize);
            (*ptr).next = NONE;
            (*ptr).count = 0;
        }
    }

    fn chunk_set_next(&self, idx: u32, next: u32) {
        // SAFETY: see `chunk_get`.
        unsafe { (*self.chunk_ptr(idx as usize)).next = next };
    }

    fn chunk_push_entry(&self, idx: u32, hash32: u32, string_slot: u32) {
        // SAFETY: `count < CHUNK_CAPACITY` is guaranteed by
        // `insert_bucket_entry`'s chunk-selection logic before calling this.
        unsafe {
            let ptr = self.chunk_ptr(idx as usize);
            let count = (*ptr).count as usize;
            debug_assert!(count < CHUNK_CAPACITY);
            (*ptr).entries[count] = ChunkEntry { hash32, string_slot };
            (*ptr).count = (count + 1) as u32;
        }
    }

    #[inline]
    fn descriptor_get(&self, slot: usize) -> StringDescriptor {
        debug_assert!(slot < self.string_count.get());
        // SAFETY: `descriptors` is committed for at least `string_count`
        // descriptors, and every slot `< string_count` has been written.
        unsafe { *(self.descriptors.as_ptr() as *const StringDescriptor).add(slot) }
    }

    #[inline]
    fn descriptor_set(&self, slot: usize, descriptor: StringDescriptor) {
        debug_assert!(slot < self.descriptor_commit.get());
        // SAFETY: same as `descriptor_get`.
        unsafe { *(self.descriptors.as_ptr() as *mut StringDescriptor).add(slot) = descriptor };
    }

    fn payload_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.data_next.get());
        // SAFETY: `data` is committed for at least `data_next` bytes, and
        // every byte in `[offset, offset + len)` was written by a prior
        // intern or rebuild.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().add(offset), len) }
    }
}

fn next_pow2(n: usize) -> usize {
    let mut p = 1usize;
    while p < n {
        p <<= 1;
    }
    p
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
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

fn le_bytes_of<T, F, const N: usize>(units: &[T], to_le: F) -> Vec<u8>
where
    T: Copy,
    F: Fn(T) -> [u8; N],
{
    let mut bytes = Vec::with_capacity(units.len() * N);
    for &u in units {
        bytes.extend_from_slice(&to_le(u));
    }
    bytes
}

/// # Safety
/// `[offset, offset + 4)` must lie within a committed, writable range of
/// `base`.
unsafe fn write_u32(base: *mut u8, offset: usize, value: u32) {
    std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), base.add(offset), 4);
}

/// # Safety
/// `[offset, offset + 4)` must lie within a committed, readable range of
/// `base`.
unsafe fn read_u32(base: *mut u8, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    std::ptr::copy_nonoverlapping(base.add(offset), bytes.as_mut_ptr(), 4);
    u32::from_le_bytes(bytes)
}

// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::HandleTableError;
use crate::handle::{Handle, SparseWord, TableTag, MAX_CAPACITY};
use crate::raw_buffer::RawBuffer;
use crate::spec::{StreamId, TableSpec};
use std::cell::Cell;

/// A dense-packed entity store addressable by stable, generational 32-bit
/// [`Handle`]s. See `spec.md` §3/§4.2 for the full index/stream contract.
///
/// Any pointer/slice this table hands out (via [`Table::live_handles`],
/// [`Table::stream`], [`Table::stream_mut`]) is invalidated by the next
/// mutating call (`create_id`, `insert_id`, any `delete_id`/`delete_ids`,
/// `ensure`, a reset). The table is not `Sync`: its counters are plain
/// `Cell`s, matching the single-threaded, synchronous core design.
pub struct Table {
    tag: TableTag,
    capacity: usize,
    sparse: RawBuffer,
    dense: RawBuffer,
    streams: Vec<RawBuffer>,
    stream_sizes: Vec<usize>,
    commit_count: Cell<usize>,
    active_count: Cell<usize>,
    high_watermark: Cell<usize>,
}

impl Table {
    /// Creates a table per `spec`. The sparse array is committed in full up
    /// front; the dense array and every stream are committed up to
    /// `spec.initial_commit` elements and grown on demand via
    /// [`Table::ensure`].
    pub fn create(spec: TableSpec) -> Result<Table, HandleTableError> {
        if spec.table_capacity == 0 || spec.table_capacity > MAX_CAPACITY {
            return Err(HandleTableError::InvalidArgs(
                "table_capacity must be in [1, 1 << 20]",
            ));
        }
        if spec.initial_commit > spec.table_capacity {
            return Err(HandleTableError::InvalidArgs(
                "initial_commit must not exceed table_capacity",
            ));
        }
        if spec.streams.iter().any(|s| s.element_size == 0) {
            return Err(HandleTableError::InvalidArgs(
                "every stream's element_size must be non-zero",
            ));
        }

        let capacity = spec.table_capacity;
        let sparse = RawBuffer::new(capacity * 4, capacity * 4)?;
        let dense = RawBuffer::new(capacity * 4, spec.initial_commit * 4)?;

        let mut streams = Vec::with_capacity(spec.streams.len());
        let mut stream_sizes = Vec::with_capacity(spec.streams.len());
        for stream_spec in &spec.streams {
            let buf = RawBuffer::new(
                capacity * stream_spec.element_size,
                spec.initial_commit * stream_spec.element_size,
            )?;
            streams.push(buf);
            stream_sizes.push(stream_spec.element_size);
        }

        tracing::debug!(
            capacity,
            initial_commit = spec.initial_commit,
            stream_count = streams.len(),
            tag = spec.tag.get(),
            "handle table created"
        );

        Ok(Table {
            tag: spec.tag,
            capacity,
            sparse,
            dense,
            streams,
            stream_sizes,
            commit_count: Cell::new(spec.initial_commit),
            active_count: Cell::new(0),
            high_watermark: Cell::new(0),
        })
    }

    /// Grows committed capacity (dense array and every stream, in lockstep)
    /// to the smallest multiple of `chunk_size` elements `>= total_need`,
    /// capped at `table_capacity`. Idempotent when already sufficient.
    pub fn ensure(&self, total_need: usize, chunk_size: usize) -> Result<(), HandleTableError> {
        if total_need <= self.commit_count.get() {
            return Ok(());
        }
        if total_need > self.capacity {
            return Err(HandleTableError::OutOfMemory);
        }
        let chunk = chunk_size.max(1);
        let new_commit = round_up(total_need, chunk).min(self.capacity);
        if new_commit < total_need {
            return Err(HandleTableError::OutOfMemory);
        }

        self.dense.ensure(new_commit * 4, chunk * 4)?;
        for (buf, size) in self.streams.iter().zip(self.stream_sizes.iter()) {
            buf.ensure(new_commit * size, chunk * size)?;
        }
        self.commit_count.set(new_commit);
        tracing::debug!(new_commit, "handle table grew commitment");
        Ok(())
    }

    /// Allocates a fresh id. Precondition: `active_count() < commit_count()`
    /// — callers must have grown capacity via [`Table::ensure`] first. This
    /// is a caller contract, not enforced by commit growth here: violating
    /// it asserts in debug builds and returns `OutOfMemory` in release,
    /// matching the core's error-handling design for precondition
    /// violations. Returns the new handle together with its dense index.
    pub fn create_id(&self) -> Result<(Handle, usize), HandleTableError> {
        let active = self.active_count.get();
        if active >= self.commit_count.get() {
            debug_assert!(
                false,
                "create_id precondition violated: active_count must be < commit_count"
            );
            return Err(HandleTableError::OutOfMemory);
        }

        let high = self.high_watermark.get();
        let (slot, generation) = if active == high {
            let slot = high as u32;
            self.high_watermark.set(high + 1);
            (slot, 0u8)
        } else {
            let slot = self.dense_get(active);
            let generation = self.sparse_get(slot as usize).generation();
            (slot, generation)
        };

        self.sparse_set(slot as usize, SparseWord::pack(active as u32, generation));
        let handle = Handle::pack(self.tag, slot, generation);
        self.dense_set(active, handle.to_bits());
        self.active_count.set(active + 1);
        Ok((handle, active))
    }

    /// Places an externally generated handle (e.g. one shared by a joined
    /// table) into this table. Succeeds only when the handle's slot has
    /// never been used by this table.
    pub fn insert_id(&self, handle: Handle) -> Result<usize, HandleTableError> {
        if handle.is_invalid() {
            return Err(HandleTableError::InvalidArgs(
                "cannot insert the reserved invalid handle",
            ));
        }
        let slot = handle.slot() as usize;
        if slot >= self.capacity {
            return Err(HandleTableError::InvalidArgs(
                "handle slot exceeds table capacity",
            ));
        }
        if !self.sparse_get(slot).is_free() {
            return Err(HandleTableError::InvalidArgs(
                "slot is already in use by this table",
            ));
        }
        let active = self.active_count.get();
        if active >= self.commit_count.get() {
            return Err(HandleTableError::OutOfMemory);
        }

        self.sparse_set(slot, SparseWord::pack(active as u32, handle.generation()));
        self.dense_set(active, handle.to_bits());
        if slot + 1 > self.high_watermark.get() {
            self.high_watermark.set(slot + 1);
        }
        self.active_count.set(active + 1);
        Ok(active)
    }

    /// Resolves a handle to its current dense index. Fails if the handle is
    /// invalid, was minted by a different table (tag mismatch), its slot is
    /// out of range, or its generation is stale.
    pub fn resolve(&self, handle: Handle) -> Result<usize, HandleTableError> {
        if handle.is_invalid() || handle.tag() != self.tag {
            return Err(HandleTableError::NotFound);
        }
        let slot = handle.slot() as usize;
        if slot >= self.capacity {
            return Err(HandleTableError::NotFound);
        }
        let word = self.sparse_get(slot);
        if !word.flag() || word.generation() != handle.generation() {
            return Err(HandleTableError::NotFound);
        }
        Ok(word.dense_index() as usize)
    }

    /// Deletes `handle`, bumping its slot's generation so any other copy of
    /// `handle` resolves as stale forever. Returns the handle of whichever
    /// live entry was swapped into the vacated dense position, or `None` if
    /// the deleted entry was already last.
    ///
    /// Precondition: any caller-side cleanup for this entry has already run.
    pub fn delete_id(&self, handle: Handle) -> Result<Option<Handle>, HandleTableError> {
        self.delete_one(handle, true)
    }

    /// Like [`Table::delete_id`], but does not bump the slot's generation —
    /// for callers who can prove no outstanding handle to this entry can
    /// exist (e.g. restoring from a snapshot where generations were already
    /// serialized) and want the slot to compare equal to its prior handle
    /// if reused immediately.
    pub fn remove_id(&self, handle: Handle) -> Result<Option<Handle>, HandleTableError> {
        self.delete_one(handle, false)
    }

    fn delete_one(&self, handle: Handle, bump_generation: bool) -> Result<Option<Handle>, HandleTableError> {
        let dense_index = self.resolve(handle)?;
        let slot = handle.slot() as usize;
        let word = self.sparse_get(slot);
        let freed = if bump_generation {
            word.into_freed()
        } else {
            word.into_removed()
        };
        self.sparse_set(slot, freed);

        let active = self.active_count.get();
        let last = active - 1;
        let moved = if dense_index != last {
            let moved_bits = self.dense_get(last);
            let moved_handle = Handle::from_bits(moved_bits);
            self.dense_set(dense_index, moved_bits);
            let moved_slot = moved_handle.slot() as usize;
            self.sparse_set(
                moved_slot,
                SparseWord::pack(dense_index as u32, moved_handle.generation()),
            );
            for stream_idx in 0..self.streams.len() {
                self.copy_stream_element(stream_idx, last, dense_index);
            }
            Some(moved_handle)
        } else {
            None
        };
        self.dense_set(last, slot as u32);
        self.active_count.set(last);
        Ok(moved)
    }

    /// Deletes every handle in `handles` (which must contain no duplicates).
    /// Observably equivalent to calling [`Table::delete_id`] once per
    /// handle in order — the index bookkeeping and `moved`-handle results
    /// match exactly — but the source implementation instead batches the
    /// bookkeeping and stream copies into two passes to avoid redundant
    /// memmoves when a swapped-in entry is itself later displaced; that
    /// batching is a performance detail with no externally observable
    /// effect beyond which handles are reported as moved, so this
    /// implementation applies each deletion immediately rather than
    /// replicating the two-pass scheduling.
    pub fn delete_ids(&self, handles: &[Handle]) -> Result<Vec<Option<Handle>>, HandleTableError> {
        let mut results = Vec::with_capacity(handles.len());
        for &handle in handles {
            results.push(self.delete_one(handle, true)?);
        }
        Ok(results)
    }

    /// Deletes every currently live entry, bumping each one's generation so
    /// existing handles remain distinguishable from future allocations of
    /// the same slot.
    pub fn delete_all_ids(&self) {
        let active = self.active_count.get();
        for i in 0..active {
            let handle = Handle::from_bits(self.dense_get(i));
            let slot = handle.slot() as usize;
            let word = self.sparse_get(slot);
            self.sparse_set(slot, word.into_freed());
            self.dense_set(i, slot as u32);
        }
        self.active_count.set(0);
        tracing::debug!(cleared = active, "handle table cleared, generations bumped");
    }

    /// Zeroes the whole sparse array and drops every slot back to "never
    /// used", including its generation. Appropriate only when the caller
    /// guarantees no handle into this table is still outstanding.
    pub fn remove_all_ids(&self) {
        // SAFETY: `sparse` is committed in full for `capacity` `u32` words,
        // per `Table::create`.
        unsafe { std::ptr::write_bytes(self.sparse.as_ptr(), 0, self.capacity * 4) };
        self.active_count.set(0);
        self.high_watermark.set(0);
        tracing::debug!("handle table fully reset, no outstanding handles assumed");
    }

    /// The live handle stream, in dense order. Equivalent to
    /// `dense[0..active_count)`.
    pub fn live_handles(&self) -> &[Handle] {
        let len = self.active_count.get();
        // SAFETY: `dense` is committed for at least `commit_count >= len`
        // `u32` words, and `Handle` is `repr(transparent)` over `u32`.
        unsafe { std::slice::from_raw_parts(self.dense.as_ptr() as *const Handle, len) }
    }

    /// The co-indexed data for stream `id`, read-only. Panics (debug only)
    /// if `T`'s size doesn't match the stream's declared element size.
    pub fn stream<T>(&self, id: StreamId) -> &[T] {
        let buf = self.stream_buf::<T>(id);
        let len = self.active_count.get();
        // SAFETY: `buf` is committed for at least `commit_count >= len`
        // elements of `size_of::<T>()` bytes, checked by `stream_buf`.
        unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const T, len) }
    }

    /// Mutable counterpart of [`Table::stream`].
    pub fn stream_mut<T>(&mut self, id: StreamId) -> &mut [T] {
        let len = self.active_count.get();
        let buf = self.stream_buf::<T>(id);
        // SAFETY: same as `stream`, plus exclusive access via `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(buf.as_ptr() as *mut T, len) }
    }

    fn stream_buf<T>(&self, id: StreamId) -> &RawBuffer {
        let size = self.stream_sizes[id.0];
        debug_assert_eq!(
            size,
            std::mem::size_of::<T>(),
            "stream element size does not match the requested type"
        );
        &self.streams[id.0]
    }

    pub fn tag(&self) -> TableTag {
        self.tag
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.get()
    }

    pub fn active_count(&self) -> usize {
        self.active_count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.active_count.get() == 0
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark.get()
    }

    /// Debug-oriented consistency check walking every invariant from
    /// `spec.md` §3's Table Index invariants. Cheap enough to call from
    /// tests after every mutation; not on any hot path.
    pub fn verify_index(&self) -> Result<(), HandleTableError> {
        let active = self.active_count.get();
        let commit = self.commit_count.get();
        if !(active <= commit && commit <= self.capacity) {
            return Err(HandleTableError::InvalidArgs(
                "active_count <= commit_count <= capacity violated",
            ));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(HandleTableError::InvalidArgs("capacity exceeds 1 << 20"));
        }
        for i in 0..active {
            let handle = Handle::from_bits(self.dense_get(i));
            let slot = handle.slot() as usize;
            let word = self.sparse_get(slot);
            if !word.flag() {
                return Err(HandleTableError::InvalidArgs(
                    "live dense entry points at a non-live sparse slot",
                ));
            }
            if word.dense_index() as usize != i {
                return Err(HandleTableError::InvalidArgs(
                    "sparse dense_index does not match the dense position",
                ));
            }
            if word.generation() != handle.generation() {
                return Err(HandleTableError::InvalidArgs(
                    "sparse generation does not match the dense handle's generation",
                ));
            }
        }
        Ok(())
    }

    #[inline]
    fn sparse_get(&self, slot: usize) -> SparseWord {
        debug_assert!(slot < self.capacity);
        // SAFETY: `sparse` is committed in full for `capacity` `u32` words.
        unsafe { *(self.sparse.as_ptr() as *const SparseWord).add(slot) }
    }

    #[inline]
    fn sparse_set(&self, slot: usize, word: SparseWord) {
        debug_assert!(slot < self.capacity);
        // SAFETY: same as `sparse_get`.
        unsafe { *(self.sparse.as_ptr() as *mut SparseWord).add(slot) = word };
    }

    #[inline]
    fn dense_get(&self, index: usize) -> u32 {
        debug_assert!(index < self.commit_count.get());
        // SAFETY: `dense` is committed for at least `commit_count` words,
        // and the caller-side invariant `index < commit_count` holds for
        // every call site in this file.
        unsafe { *(self.dense.as_ptr() as *const u32).add(index) }
    }

    #[inline]
    fn dense_set(&self, index: usize, value: u32) {
        debug_assert!(index < self.commit_count.get());
        // SAFETY: same as `dense_get`.
        unsafe { *(self.dense.as_ptr() as *mut u32).add(index) = value };
    }

    fn copy_stream_element(&self, stream_idx: usize, from: usize, to: usize) {
        if from == to {
            return;
        }
        let size = self.stream_sizes[stream_idx];
        let base = self.streams[stream_idx].as_ptr();
        // SAFETY: `from`/`to` are both < commit_count, every stream is
        // committed for at least `commit_count * size` bytes, and the two
        // `size`-byte ranges are disjoint since `from != to`.
        unsafe {
            let src = base.add(from * size);
            let dst = base.add(to * size);
            std::ptr::copy_nonoverlapping(src, dst, size);
        }
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
    use crate::spec::StreamSpec;

    fn small_table(capacity: usize) -> Table {
        Table::create(TableSpec::new(TableTag::new(1), capacity, capacity)).unwrap()
    }

    #[test]
    fn test_create_rejects_bad_capacity() {
        assert!(matches!(
            Table::create(TableSpec::new(TableTag::new(0), 0, 0)),
            Err(HandleTableError::InvalidArgs(_))
        ));
        assert!(matches!(
            Table::create(TableSpec::new(TableTag::new(0), 4, 8)),
            Err(HandleTableError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_create_rejects_zero_size_stream() {
        let spec = TableSpec::new(TableTag::new(0), 4, 4).with_stream(StreamSpec { element_size: 0 });
        assert!(matches!(Table::create(spec), Err(HandleTableError::InvalidArgs(_))));
    }

    /// S1 from `spec.md` §8: capacity-4 table, push 0..3, delete the second.
    #[test]
    fn test_s1_scenario() {
        let mut table = Table::create(
            TableSpec::new(TableTag::new(0), 4, 4).with_stream(StreamSpec::of::<u32>()),
        )
        .unwrap();
        let stream_id = StreamId(0);

        let mut handles = Vec::new();
        for value in 0u32..4 {
            let (handle, index) = table.create_id().unwrap();
            table.stream_mut::<u32>(stream_id)[index] = value;
            handles.push(handle);
        }
        assert_eq!(&[0, 1, 2, 3], table.stream::<u32>(stream_id));

        let moved = table.delete_id(handles[1]).unwrap();
        assert_eq!(Some(handles[3]), moved);
        assert_eq!(&[0, 3, 2], table.stream::<u32>(stream_id));
        assert!(table.resolve(handles[1]).is_err());
        assert_eq!(1, table.resolve(handles[3]).unwrap());
        table.verify_index().unwrap();
    }

    /// S2 from `spec.md` §8: generation wraps at 16 and the 17th cycle
    /// reproduces the very first handle.
    #[test]
    fn test_s2_generation_wrap() {
        let table = small_table(1);
        let mut first = None;
        let mut previous = None;
        for i in 0..17u32 {
            let (handle, _) = table.create_id().unwrap();
            assert_eq!((i % 16) as u8, handle.generation());
            if let Some(prev) = previous {
                assert_ne!(prev, handle);
            }
            if i == 0 {
                first = Some(handle);
            }
            if i == 16 {
                assert_eq!(first, Some(handle));
            }
            table.delete_id(handle).unwrap();
            previous = Some(handle);
        }
    }

    #[test]
    fn test_resolve_after_delete_fails_forever() {
        let table = small_table(2);
        let (h, _) = table.create_id().unwrap();
        table.delete_id(h).unwrap();
        assert!(matches!(table.resolve(h), Err(HandleTableError::NotFound)));
    }

    #[test]
    fn test_cross_table_tag_mismatch_not_found() {
        let a = Table::create(TableSpec::new(TableTag::new(1), 4, 4)).unwrap();
        let b = Table::create(TableSpec::new(TableTag::new(2), 4, 4)).unwrap();
        let (h, _) = a.create_id().unwrap();
        assert!(matches!(b.resolve(h), Err(HandleTableError::NotFound)));
    }

    #[test]
    fn test_insert_id_rejects_reused_slot() {
        let table = small_table(4);
        let (h, _) = table.create_id().unwrap();
        assert!(matches!(
            table.insert_id(h),
            Err(HandleTableError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_insert_id_external_handle() {
        let table = small_table(8);
        let external = Handle::pack(TableTag::new(0), 5, 2);
        let index = table.insert_id(external).unwrap();
        assert_eq!(0, index);
        assert_eq!(6, table.high_watermark());
        assert_eq!(index, table.resolve(external).unwrap());
    }

    #[test]
    fn test_delete_ids_matches_sequential_delete_id() {
        let mut a = Table::create(
            TableSpec::new(TableTag::new(0), 8, 8).with_stream(StreamSpec::of::<u32>()),
        )
        .unwrap();
        let mut b = Table::create(
            TableSpec::new(TableTag::new(0), 8, 8).with_stream(StreamSpec::of::<u32>()),
        )
        .unwrap();

        let mut handles_a = Vec::new();
        let mut handles_b = Vec::new();
        for value in 0u32..8 {
            let (ha, ia) = a.create_id().unwrap();
            a.stream_mut::<u32>(StreamId(0))[ia] = value;
            handles_a.push(ha);
            let (hb, ib) = b.create_id().unwrap();
            b.stream_mut::<u32>(StreamId(0))[ib] = value;
            handles_b.push(hb);
        }

        let to_delete = [handles_a[1], handles_a[4], handles_a[6]];
        let bulk_results = a.delete_ids(&to_delete).unwrap();

        let to_delete_b = [handles_b[1], handles_b[4], handles_b[6]];
        let mut sequential_results = Vec::new();
        for h in to_delete_b {
            sequential_results.push(b.delete_id(h).unwrap());
        }

        assert_eq!(bulk_results, sequential_results);
        assert_eq!(a.stream::<u32>(StreamId(0)), b.stream::<u32>(StreamId(0)));
        assert_eq!(a.live_handles(), b.live_handles());
        a.verify_index().unwrap();
        b.verify_index().unwrap();
    }

    /// S3 from `spec.md` §8: bulk push/delete cycles, checking invariants
    /// throughout, ending empty with a bounded high watermark.
    #[test]
    fn test_s3_bulk_validation() {
        const N: usize = 1024;
        let mut table =
            Table::create(TableSpec::new(TableTag::new(0), N, N).with_stream(StreamSpec::of::<u32>()))
                .unwrap();

        for cycle in 0..4u32 {
            let mut handles = Vec::with_capacity(N);
            for i in 0..N {
                let (h, idx) = table.create_id().unwrap();
                table.stream_mut::<u32>(StreamId(0))[idx] = (cycle as usize * N + i) as u32;
                handles.push(h);
                table.verify_index().unwrap();
            }

            let even: Vec<Handle> = handles.iter().step_by(2).copied().collect();
            for h in even {
                table.delete_id(h).unwrap();
                table.verify_index().unwrap();
            }
            let odd: Vec<Handle> = handles.iter().skip(1).step_by(2).copied().collect();
            for h in odd {
                table.delete_id(h).unwrap();
                table.verify_index().unwrap();
            }
        }

        assert_eq!(0, table.active_count());
        assert!(table.high_watermark() <= N);
    }

    #[test]
    fn test_remove_id_does_not_bump_generation() {
        let table = small_table(2);
        let (h, _) = table.create_id().unwrap();
        let gen_before = h.generation();
        table.remove_id(h).unwrap();
        let (h2, _) = table.create_id().unwrap();
        assert_eq!(gen_before, h2.generation());
    }

    #[test]
    fn test_delete_all_ids_preserves_generations() {
        let table = small_table(4);
        let (h0, _) = table.create_id().unwrap();
        let (h1, _) = table.create_id().unwrap();
        table.delete_all_ids();
        assert_eq!(0, table.active_count());
        assert!(table.resolve(h0).is_err());
        assert!(table.resolve(h1).is_err());

        let (new0, _) = table.create_id().unwrap();
        assert_eq!(h0.generation() + 1, new0.generation());
    }

    #[test]
    fn test_remove_all_ids_resets_generations_too() {
        let table = small_table(4);
        table.create_id().unwrap();
        table.create_id().unwrap();
        table.remove_all_ids();
        assert_eq!(0, table.active_count());
        assert_eq!(0, table.high_watermark());
        let (h, _) = table.create_id().unwrap();
        assert_eq!(0, h.generation());
        assert_eq!(0, h.slot());
    }

    #[test]
    fn test_ensure_grows_then_create_id_succeeds() {
        let table = Table::create(TableSpec::new(TableTag::new(0), 100, 1)).unwrap();
        assert!(table.create_id().is_ok());
        assert!(matches!(
            table.create_id(),
            Err(HandleTableError::OutOfMemory)
        ));
        table.ensure(10, 16).unwrap();
        assert_eq!(16, table.commit_count());
        for _ in 0..9 {
            table.create_id().unwrap();
        }
    }
}

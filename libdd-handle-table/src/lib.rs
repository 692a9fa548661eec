// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A dense-packed entity store addressable by stable 32-bit handles that
//! detect use-after-free and cross-table mix-ups.
//!
//! The core type is [`Table`]: a sparse/dense index (`spec.md` §3 "Table
//! Index") plus zero or more co-indexed parallel data streams (`spec.md` §3
//! "Table Data Stream"). Resolution is O(1); deletion is O(1) swap-and-pop;
//! iteration over `dense[0..active_count)` is cache-friendly since live
//! entries are always packed at the front with no gaps.
//!
//! Handles are newtypes over a packed `u32` (see [`handle`] for the exact
//! bit layout) rather than raw pointers or indices, so a stale handle into
//! a freed or reused slot is detected by [`Table::resolve`] instead of
//! silently aliasing unrelated data.

mod error;
mod handle;
mod raw_buffer;
mod spec;
mod table;

pub use error::HandleTableError;
pub use handle::{Handle, TableTag, GENERATION_BITS, GENERATION_MODULUS, MAX_CAPACITY};
pub use spec::{StreamId, StreamSpec, TableSpec};
pub use table::Table;

#[cfg(test)]
mod prop_tests {
    use super::*;

    #[derive(Debug, Clone, Copy, bolero::generator::TypeGenerator)]
    enum Op {
        Create,
        DeleteNth(u8),
    }

    /// Property 1 + property 4 (`spec.md` §8): across any sequence of
    /// create/delete operations, live handles are always unique, and
    /// `dense[0..active_count)` always matches the set of currently live
    /// handles with no gaps.
    #[test]
    fn fuzz_handle_uniqueness_and_dense_packing() {
        bolero::check!()
            .with_type::<Vec<Op>>()
            .for_each(|ops| {
                let table = Table::create(TableSpec::new(TableTag::new(7), 256, 256)).unwrap();
                let mut live: Vec<Handle> = Vec::new();
                for op in ops {
                    match op {
                        Op::Create => {
                            if table.active_count() == table.capacity() {
                                continue;
                            }
                            let (handle, index) = table.create_id().unwrap();
                            assert_eq!(index, table.active_count() - 1);
                            assert!(!live.contains(&handle), "handle reused while still live");
                            live.push(handle);
                        }
                        Op::DeleteNth(n) => {
                            if live.is_empty() {
                                continue;
                            }
                            let idx = *n as usize % live.len();
                            let handle = live.remove(idx);
                            table.delete_id(handle).unwrap();
                        }
                    }
                    table.verify_index().unwrap();
                    assert_eq!(live.len(), table.active_count());
                    let dense = table.live_handles();
                    for h in &live {
                        assert!(dense.contains(h));
                    }
                }
            });
    }
}

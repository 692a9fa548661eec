// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::handle::TableTag;

/// Describes one parallel data stream co-indexed with a table's dense array.
/// The table itself stores only the element size and a raw committed
/// buffer; callers get a typed `&[T]`/`&mut [T]` view back via
/// [`crate::Table::stream`]/[`crate::Table::stream_mut`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamSpec {
    pub element_size: usize,
}

impl StreamSpec {
    /// A stream spec sized for `T`.
    pub const fn of<T>() -> Self {
        StreamSpec {
            element_size: std::mem::size_of::<T>(),
        }
    }
}

/// Identifies one of a table's streams by its position in
/// [`TableSpec::streams`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamId(pub usize);

/// Describes how to create a [`crate::Table`].
#[derive(Clone, Debug)]
pub struct TableSpec {
    /// Stamped into every handle this table produces; lets
    /// [`crate::Table::resolve`] reject handles minted by a different
    /// table without walking any state.
    pub tag: TableTag,
    /// Maximum number of live entries the table can ever hold. The sparse
    /// slot-index field is 20 bits wide, so this must be in `[1, 1 << 20]`.
    pub table_capacity: usize,
    /// Number of elements committed up front for the dense array and every
    /// stream (the sparse array is always committed in full, up front).
    pub initial_commit: usize,
    pub streams: Vec<StreamSpec>,
}

impl TableSpec {
    pub fn new(tag: TableTag, table_capacity: usize, initial_commit: usize) -> Self {
        TableSpec {
            tag,
            table_capacity,
            initial_commit,
            streams: Vec::new(),
        }
    }

    /// Appends a data stream to the spec; streams are addressed by the
    /// [`StreamId`] matching their position in this list.
    pub fn with_stream(mut self, spec: StreamSpec) -> Self {
        self.streams.push(spec);
        self
    }
}

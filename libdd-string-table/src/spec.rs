// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Public value types for the string table: its creation spec, character
//! encoding tag, per-string descriptor, and the opaque interned-string
//! handle.

/// The encoding a stored string was interned under. Carried per-descriptor
/// so a single table may hold mixed encodings, each hashed in its own
/// bucket keyed by that encoding's hash (`spec.md` §4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CharType {
    Unknown,
    Utf8,
    Utf16,
    Utf32,
}

impl CharType {
    pub(crate) fn from_raw(value: u32) -> CharType {
        match value {
            1 => CharType::Utf8,
            2 => CharType::Utf16,
            3 => CharType::Utf32,
            _ => CharType::Unknown,
        }
    }

    pub(crate) fn as_raw(self) -> u32 {
        match self {
            CharType::Unknown => 0,
            CharType::Utf8 => 1,
            CharType::Utf16 => 2,
            CharType::Utf32 => 3,
        }
    }

    /// Width in bytes of this encoding's NUL terminator unit.
    pub fn nul_unit_bytes(self) -> usize {
        match self {
            CharType::Utf16 => 2,
            CharType::Utf32 => 4,
            CharType::Unknown | CharType::Utf8 => 1,
        }
    }
}

/// An opaque, `Copy` handle to an interned string, returned by
/// [`crate::StringTable::intern_utf8`] and friends. Wraps a validated byte
/// offset into the table's data block rather than a raw pointer, so this
/// crate's public surface has no unsafe entry points for ordinary callers —
/// [`crate::StringTable::get_string_info`] still performs the
/// back-index-before-the-payload trick internally (`spec.md` §9).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StringHandle(pub(crate) u32);

impl StringHandle {
    /// The raw data-block offset this handle wraps; useful for
    /// serialization or debugging, not for direct memory access.
    pub fn offset(self) -> u32 {
        self.0
    }
}

/// Descriptor stored per interned string (`spec.md` §3 "strings" array /
/// §6 serialization layout).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct StringDescriptor {
    pub byte_offset: u32,
    pub byte_length_with_nul: u32,
    pub char_length: u32,
    char_type_raw: u32,
}

impl StringDescriptor {
    pub(crate) fn new(
        byte_offset: u32,
        byte_length_with_nul: u32,
        char_length: u32,
        char_type: CharType,
    ) -> Self {
        StringDescriptor {
            byte_offset,
            byte_length_with_nul,
            char_length,
            char_type_raw: char_type.as_raw(),
        }
    }

    pub fn char_type(&self) -> CharType {
        CharType::from_raw(self.char_type_raw)
    }

    /// Byte length of the string's content alone, excluding its NUL
    /// terminator unit.
    pub fn content_len(&self) -> usize {
        self.byte_length_with_nul as usize - self.char_type().nul_unit_bytes()
    }
}

/// Describes how to create a [`crate::StringTable`].
#[derive(Clone, Copy, Debug)]
pub struct StringTableSpec {
    pub max_data_bytes: usize,
    pub initial_data_commit: usize,
    pub max_strings: usize,
    pub initial_strings: usize,
}

/// A read-only snapshot of a table's storage, for serialization (`spec.md`
/// §4.3 `GetTableInfo`, §6 serialization layout).
#[derive(Clone, Copy, Debug)]
pub struct StringTableInfo<'a> {
    pub descriptors: &'a [StringDescriptor],
    pub data: &'a [u8],
    pub count: usize,
    pub bytes: usize,
}

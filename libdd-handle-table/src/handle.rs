// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The 32-bit packed handle and the matching sparse-slot word, per
//! `spec.md` §3/§6. Bit layout, MSB to LSB:
//!
//! ```text
//! bit:   31  30      24 23           4 3   0
//!       [ F ][   S    ][      I       ][ G ]
//! ```
//!
//! `F` (1 bit) is the "ever-valid" flag, `S` (7 bits) is a caller-chosen
//! table tag used to catch cross-table misuse, `I` (20 bits) is the sparse
//! slot index, and `G` (4 bits) is the generation counter. The all-zero
//! value is reserved to mean "invalid" and is never returned as a live
//! handle.
//!
//! Because the fields are packed MSB-to-LSB in exactly this priority order,
//! ordinary unsigned integer comparison of two packed handles already
//! implements the documented sort order (by tag, then slot, then
//! generation) — no separate comparator is needed.

/// Number of bits used for the generation counter. `spec.md` §9 notes this
/// width is deliberately narrow (adequate for immediate use-after-free
/// detection, but it aliases after `2^GENERATION_BITS` recycles of the same
/// slot) and records widening it as a deliberate choice, not a bug fix.
pub const GENERATION_BITS: u32 = 4;
/// `2^GENERATION_BITS`: generations wrap back to 0 after this many deletes
/// of the same slot.
pub const GENERATION_MODULUS: u8 = 1 << GENERATION_BITS;

const SLOT_BITS: u32 = 20;
const SLOT_SHIFT: u32 = GENERATION_BITS;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

const TAG_BITS: u32 = 7;
const TAG_SHIFT: u32 = SLOT_SHIFT + SLOT_BITS;
const TAG_MASK: u32 = (1 << TAG_BITS) - 1;

const FLAG_SHIFT: u32 = TAG_SHIFT + TAG_BITS;
const FLAG_BIT: u32 = 1 << FLAG_SHIFT;

const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Maximum table capacity: the slot index is 20 bits wide.
pub const MAX_CAPACITY: usize = 1 << SLOT_BITS;

/// A caller-chosen 7-bit tag stamped into every handle a table produces,
/// letting [`crate::Table::resolve`] cheaply reject a handle that was
/// produced by a different table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct TableTag(u8);

impl TableTag {
    /// Masks `value` down to 7 bits.
    pub const fn new(value: u8) -> Self {
        TableTag(value & TAG_MASK as u8)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

/// A stable, 32-bit packed identifier for an entry in a [`crate::Table`].
/// The value `0` is reserved and always means "invalid"; it is never
/// returned by [`crate::Table::create_id`].
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The reserved "invalid" value.
    pub const INVALID: Handle = Handle(0);

    /// Packs a live handle from its fields. Always sets the ever-valid
    /// flag, since only live handles are constructed this way; the
    /// all-zero `INVALID` value is the sole representation of "no handle".
    pub(crate) fn pack(tag: TableTag, slot: u32, generation: u8) -> Handle {
        debug_assert!(slot as usize <= SLOT_MASK as usize);
        debug_assert!(generation < GENERATION_MODULUS);
        let bits = FLAG_BIT
            | ((tag.get() as u32 & TAG_MASK) << TAG_SHIFT)
            | ((slot & SLOT_MASK) << SLOT_SHIFT)
            | (generation as u32 & GENERATION_MASK);
        Handle(bits)
    }

    /// Returns the raw 32-bit encoding, little-endian on the wire per
    /// `spec.md` §6.
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Reconstructs a handle from a raw 32-bit value, e.g. one read back
    /// from serialized state. Does not validate it against any table.
    pub const fn from_bits(bits: u32) -> Handle {
        Handle(bits)
    }

    /// The "ever-valid" flag. `INVALID` is the only handle with this unset.
    pub const fn flag(self) -> bool {
        self.0 & FLAG_BIT != 0
    }

    pub const fn tag(self) -> TableTag {
        TableTag(((self.0 >> TAG_SHIFT) & TAG_MASK) as u8)
    }

    pub const fn slot(self) -> u32 {
        (self.0 >> SLOT_SHIFT) & SLOT_MASK
    }

    pub const fn generation(self) -> u8 {
        (self.0 & GENERATION_MASK) as u8
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "Handle(INVALID)")
        } else {
            f.debug_struct("Handle")
                .field("tag", &self.tag().get())
                .field("slot", &self.slot())
                .field("generation", &self.generation())
                .finish()
        }
    }
}

/// The word stored in a table's sparse array: the same bit layout as
/// [`Handle`], but the 20-bit field holds a dense-array index rather than a
/// sparse slot index, and the tag field is unused. Zero means "free, never
/// used".
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub(crate) struct SparseWord(u32);

impl SparseWord {
    pub const FREE: SparseWord = SparseWord(0);

    pub fn pack(dense_index: u32, generation: u8) -> SparseWord {
        debug_assert!(dense_index as usize <= SLOT_MASK as usize);
        debug_assert!(generation < GENERATION_MODULUS);
        SparseWord(FLAG_BIT | ((dense_index & SLOT_MASK) << SLOT_SHIFT) | (generation as u32 & GENERATION_MASK))
    }

    pub fn flag(self) -> bool {
        self.0 & FLAG_BIT != 0
    }

    pub fn dense_index(self) -> u32 {
        (self.0 >> SLOT_SHIFT) & SLOT_MASK
    }

    pub fn generation(self) -> u8 {
        (self.0 & GENERATION_MASK) as u8
    }

    pub fn is_free(self) -> bool {
        self.0 == 0
    }

    /// Bumps the generation, wrapping modulo `2^GENERATION_BITS`, and clears
    /// the live flag.
    pub fn into_freed(self) -> SparseWord {
        let next_gen = (self.generation() + 1) % GENERATION_MODULUS;
        // A freed slot is not "free, never used" (that's all-zero), it
        // just has its flag cleared; dense_index is meaningless until the
        // slot is reused, but we keep it around for debuggability.
        SparseWord(((self.0 >> SLOT_SHIFT) & SLOT_MASK) << SLOT_SHIFT | next_gen as u32)
    }

    /// Clears the live flag without touching the generation, for
    /// [`crate::Table::remove_id`]: unlike [`Self::into_freed`], a removed
    /// slot's generation is left exactly as it was so a caller who already
    /// knows no outstanding handle can exist may reuse it without bumping.
    pub fn into_removed(self) -> SparseWord {
        SparseWord(((self.0 >> SLOT_SHIFT) & SLOT_MASK) << SLOT_SHIFT | self.generation() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_is_all_zero() {
        assert_eq!(0, Handle::INVALID.to_bits());
        assert!(Handle::INVALID.is_invalid());
        assert!(!Handle::INVALID.flag());
    }

    #[test]
    fn test_pack_roundtrip() {
        let h = Handle::pack(TableTag::new(0x2A), 12345, 7);
        assert!(h.flag());
        assert_eq!(0x2A, h.tag().get());
        assert_eq!(12345, h.slot());
        assert_eq!(7, h.generation());
        assert!(!h.is_invalid());
    }

    #[test]
    fn test_tag_masked_to_7_bits() {
        let tag = TableTag::new(0xFF);
        assert_eq!(0x7F, tag.get());
    }

    #[test]
    fn test_sort_order_matches_bit_priority() {
        let low_tag = Handle::pack(TableTag::new(1), 0, 0);
        let high_tag = Handle::pack(TableTag::new(2), 0, 0);
        assert!(low_tag < high_tag);

        let low_slot = Handle::pack(TableTag::new(1), 5, 0);
        let high_slot = Handle::pack(TableTag::new(1), 6, 0);
        assert!(low_slot < high_slot);

        let low_gen = Handle::pack(TableTag::new(1), 5, 0);
        let high_gen = Handle::pack(TableTag::new(1), 5, 1);
        assert!(low_gen < high_gen);
    }

    #[test]
    fn test_sparse_word_free_is_zero() {
        assert!(SparseWord::FREE.is_free());
    }

    #[test]
    fn test_sparse_word_into_removed_keeps_generation() {
        let word = SparseWord::pack(3, 5);
        let removed = word.into_removed();
        assert!(!removed.flag());
        assert_eq!(5, removed.generation());
    }

    #[test]
    fn test_sparse_word_generation_wraps() {
        let mut word = SparseWord::pack(3, GENERATION_MODULUS - 1);
        word = word.into_freed();
        assert_eq!(0, word.generation());
        assert!(!word.flag());
    }
}

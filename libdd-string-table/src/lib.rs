// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A partially-committed, append-only string-interning table over mixed
//! UTF-8/16/32 content, with a chained hash index for deduplication and a
//! serialize/rebuild cycle for persistence.

mod chunk;
mod error;
mod hash;
mod raw_buffer;
mod spec;
mod table;

pub use error::StringTableError;
pub use hash::{hash_bytes, hash_utf16, hash_utf32, hash_utf8, StringHash};
pub use spec::{CharType, StringDescriptor, StringHandle, StringTableInfo, StringTableSpec};
pub use table::StringTable;

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn table(max_strings: usize, max_data_bytes: usize) -> StringTable {
        StringTable::create(StringTableSpec {
            max_data_bytes,
            initial_data_commit: 0,
            max_strings,
            initial_strings: 0,
        })
        .unwrap()
    }

    /// S4: interning the same text under UTF-8 and UTF-16 yields distinct
    /// handles, but repeated UTF-8 interns of identical text dedup to one.
    #[test]
    fn test_s4_mixed_encoding_dedup() {
        let t = table(64, 16 * 1024);
        let utf8_first = t.intern_utf8("dedup-me").unwrap();
        let utf16: Vec<u16> = "dedup-me".encode_utf16().collect();
        let utf16_handle = t.intern_utf16(&utf16).unwrap();
        let utf8_second = t.intern_utf8("dedup-me").unwrap();

        assert_eq!(utf8_first, utf8_second);
        assert_ne!(utf8_first, utf16_handle);
        assert_eq!(2, t.len());
    }

    /// S5: intern a batch, snapshot via `table_info`, rebuild a fresh table
    /// from that snapshot, and confirm every string round-trips to the same
    /// handle and descriptor.
    #[test]
    fn test_s5_snapshot_rebuild_round_trip() {
        let mut source = table(32, 8 * 1024);
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(source.intern_utf8(&format!("entry-{i}")).unwrap());
        }

        let (descriptors, data) = {
            let info = source.table_info();
            assert_eq!(10, info.count);
            (info.descriptors.to_vec(), info.data.to_vec())
        };

        let mut rebuilt = table(32, 8 * 1024);
        rebuilt.rebuild_from(&descriptors, &data).unwrap();
        assert_eq!(10, rebuilt.len());

        for (i, original_handle) in handles.iter().enumerate() {
            let again = rebuilt.intern_utf8(&format!("entry-{i}")).unwrap();
            assert_eq!(*original_handle, again);
            let info = rebuilt.get_string_info(again).unwrap();
            assert_eq!(format!("entry-{i}").len(), info.content_len());
        }
    }

    #[test]
    fn test_out_of_memory_on_exhausted_slots() {
        let t = table(2, 4096);
        t.intern_utf8("a").unwrap();
        t.intern_utf8("b").unwrap();
        assert!(matches!(t.intern_utf8("c"), Err(StringTableError::OutOfMemory)));
    }

    #[test]
    fn test_out_of_memory_on_exhausted_data() {
        let t = table(1024, 64);
        let long = "x".repeat(200);
        assert!(matches!(t.intern_utf8(&long), Err(StringTableError::OutOfMemory)));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;

    #[derive(Clone, Copy, Debug, bolero::generator::TypeGenerator)]
    enum Op {
        InternUtf8(u8),
        InternUtf16(u8),
    }

    /// Property: for any sequence of interns over a small alphabet, every
    /// handle this table has ever returned still resolves to a descriptor
    /// whose bytes match what was originally interned, and identical
    /// (text, encoding) pairs always collapse to one handle.
    #[test]
    fn fuzz_intern_is_consistent_and_dedups() {
        bolero::check!().with_type::<Vec<Op>>().for_each(|ops| {
            let t = StringTable::create(StringTableSpec {
                max_data_bytes: 256 * 1024,
                initial_data_commit: 0,
                max_strings: 4096,
                initial_strings: 0,
            })
            .unwrap();

            let mut utf8_handles = std::collections::HashMap::new();
            let mut utf16_handles = std::collections::HashMap::new();

            for op in ops {
                match *op {
                    Op::InternUtf8(byte) => {
                        let text = format!("u8-{byte}");
                        let handle = t.intern_utf8(&text).unwrap();
                        if let Some(&prior) = utf8_handles.get(&text) {
                            assert_eq!(prior, handle);
                        } else {
                            utf8_handles.insert(text, handle);
                        }
                    }
                    Op::InternUtf16(byte) => {
                        let text = format!("u16-{byte}");
                        let units: Vec<u16> = text.encode_utf16().collect();
                        let handle = t.intern_utf16(&units).unwrap();
                        if let Some(&prior) = utf16_handles.get(&text) {
                            assert_eq!(prior, handle);
                        } else {
                            utf16_handles.insert(text, handle);
                        }
                    }
                }
            }

            for (text, handle) in &utf8_handles {
                let info = t.get_string_info(*handle).unwrap();
                assert_eq!(text.len(), info.content_len());
                assert_eq!(CharType::Utf8, info.char_type());
            }
            for (text, handle) in &utf16_handles {
                let info = t.get_string_info(*handle).unwrap();
                assert_eq!(text.encode_utf16().count() * 2, info.content_len());
                assert_eq!(CharType::Utf16, info.char_type());
            }
        });
    }
}

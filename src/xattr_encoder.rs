//! Packs a file's extended attributes into the inode's 96-byte inline area
//! and, when they don't fit, a single dedicated xattr block.
//!
//! Name compression follows the real ext4 index assignment (`user.`=1,
//! `system.posix_acl_access`=2, `system.posix_acl_default`=3, `trusted.`=4,
//! `security.`=6, `system.`=7, `system.richacl`=8); index 5 is reserved and
//! never assigned here.

use crate::error::{Error, Result};
use crate::ondisk::xattr::{write_block_header, write_inline_header, XattrEntry, ENTRY_HEADER_SIZE};

const INLINE_AREA_SIZE: usize = 96;
const INLINE_HEADER_SIZE: usize = 4;
const BLOCK_HEADER_SIZE: usize = 32;
/// Terminator: an all-zero entry header (`e_name_len = 0`) marking the end
/// of the entry list.
const TERMINATOR_SIZE: usize = 4;

pub struct EncodedXattrs {
    pub inline: [u8; INLINE_AREA_SIZE],
    /// `Some` when the attribute set overflowed into a dedicated xattr
    /// block; caller is responsible for appending it and pointing the
    /// inode's `file_acl` field at the resulting block number.
    pub block: Option<Vec<u8>>,
}

/// Splits `name` into its recognized ext4 attribute-name index and the
/// remaining (unprefixed) suffix, `0` for anything unrecognized.
fn compress_name(name: &str) -> (u8, String) {
    const PREFIXED: &[(&str, u8)] = &[
        ("system.posix_acl_access", 2),
        ("system.posix_acl_default", 3),
        ("system.richacl", 8),
        ("user.", 1),
        ("trusted.", 4),
        ("security.", 6),
        ("system.", 7),
    ];
    for (prefix, index) in PREFIXED {
        if name == *prefix {
            return (*index, String::new());
        }
        if let Some(suffix) = name.strip_prefix(prefix) {
            return (*index, suffix.to_string());
        }
    }
    (0, name.to_string())
}

fn build_entries(xattrs: &[(String, Vec<u8>)]) -> Vec<XattrEntry> {
    let mut entries = Vec::with_capacity(xattrs.len() + 1);
    // Synthetic marker attribute prepended ahead of caller-supplied ones.
    entries.push(XattrEntry {
        name_index: 7,
        name: b"data".to_vec(),
        value: Vec::new(),
    });
    for (name, value) in xattrs {
        let (name_index, suffix) = compress_name(name);
        entries.push(XattrEntry {
            name_index,
            name: suffix.into_bytes(),
            value: value.clone(),
        });
    }
    entries
}

/// Greedily packs `entries` into a `total_len`-byte region whose entry list
/// starts at `entries_start` (right after whatever fixed header precedes
/// it), with values filled in from the tail of the region backward. Returns
/// `None` if they don't all fit.
fn pack_region(entries: &[XattrEntry], total_len: usize, entries_start: usize) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; total_len];
    let mut entry_cursor = entries_start;
    let mut value_cursor = total_len;
    for entry in entries {
        let region_len = entry.header_region_len();
        let value_len = entry.value.len();
        if entry_cursor + region_len + TERMINATOR_SIZE > value_cursor.saturating_sub(value_len) {
            return None;
        }
        value_cursor -= value_len;
        entry.write_header(&mut buf[entry_cursor..entry_cursor + region_len], value_cursor as u16);
        buf[value_cursor..value_cursor + value_len].copy_from_slice(&entry.value);
        entry_cursor += region_len;
    }
    // The terminator is an all-zero entry header; `buf` is already zeroed.
    let _ = entry_cursor;
    Some(buf)
}

pub struct XattrEncoder;

impl XattrEncoder {
    /// Encodes `xattrs` for a file at `path` (used only for the error
    /// message), trying the inline area first and falling back to a single
    /// fresh xattr block sized to `block_size`.
    pub fn encode(block_size: u64, path: &str, xattrs: &[(String, Vec<u8>)]) -> Result<EncodedXattrs> {
        let entries = build_entries(xattrs);

        if let Some(region) = pack_region(&entries, INLINE_AREA_SIZE, INLINE_HEADER_SIZE) {
            let mut inline = [0u8; INLINE_AREA_SIZE];
            write_inline_header(&mut inline);
            inline[INLINE_HEADER_SIZE..].copy_from_slice(®ion[INLINE_HEADER_SIZE..]);
            return Ok(EncodedXattrs { inline, block: None });
        }

        let mut sorted = entries;
        sorted.sort_by(|a, b| (a.name_index, a.name.len(), &a.name).cmp(&(b.name_index, b.name.len(), &b.name)));
        if let Some(region) = pack_region(&sorted, block_size as usize, BLOCK_HEADER_SIZE) {
            let mut block = vec![0u8; block_size as usize];
            // No real CRC32C is computed here, mirroring the accepted
            // extent-tail checksum shortcut (see `ondisk::extent::ExtentTail`).
            write_block_header(&mut block, 0);
            block[BLOCK_HEADER_SIZE..].copy_from_slice(®ion[BLOCK_HEADER_SIZE..]);
            let mut inline = [0u8; INLINE_AREA_SIZE];
            write_inline_header(&mut inline);
            return Ok(EncodedXattrs {
                inline,
                block: Some(block),
            });
        }

        Err(Error::InsufficientSpace(path.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compresses_recognized_prefixes() {
        assert_eq!(compress_name("user.comment"), (1, "comment".to_string()));
        assert_eq!(compress_name("system.posix_acl_access"), (2, String::new()));
        assert_eq!(compress_name("trusted.overlay.opaque"), (4, "overlay.opaque".to_string()));
        assert_eq!(compress_name("security.capability"), (6, "capability".to_string()));
        assert_eq!(compress_name("bogus.whatever"), (0, "bogus.whatever".to_string()));
    }

    #[test]
    fn small_set_fits_inline() {
        let encoded = XattrEncoder::encode(4096, "/x", &[("user.a".to_string(), vec![1, 2, 3])]).unwrap();
        assert!(encoded.block.is_none());
        assert_eq!(u32::from_le_bytes(encoded.inline[0..4].try_into().unwrap()), 0xEA02_0000);
    }

    #[test]
    fn oversized_set_spills_to_block() {
        let big_value = vec![0xAB; 80];
        let xattrs: Vec<_> = (0..5)
            .map(|i| (format!("user.attr{i}"), big_value.clone()))
            .collect();
        let encoded = XattrEncoder::encode(4096, "/x", &xattrs).unwrap();
        assert!(encoded.block.is_some());
    }

    #[test]
    fn truly_oversized_set_fails() {
        let big_value = vec![0xAB; 4000];
        let xattrs: Vec<_> = (0..5)
            .map(|i| (format!("user.attr{i}"), big_value.clone()))
            .collect();
        let err = XattrEncoder::encode(4096, "/x", &xattrs);
        assert!(err.is_err());
    }
}

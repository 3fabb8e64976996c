#![forbid(unsafe_code)]
//! btrfs on-disk structures: keys, the item schema, and the leaf decoder.
//!
//! Everything here is a zero-copy view over untrusted bytes. Field lengths
//! from the disk are never trusted: names clamp to 255 bytes, payload slices
//! clamp to the block, and item counts clamp to what the block can hold.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

mod items;
mod leaf;

pub use items::{
    BlockGroupItem, Chunk, CsumItem, DevExtent, DevItem, DirItem, ExtentItem, FileExtentItem,
    InodeItem, InodeRef, ItemView, RootItem, RootRef, Stripe, view_for,
};
pub use leaf::{HEADER_LEN, Header, ITEM_LEN, Item, Leaf};

// ── Object ids ──────────────────────────────────────────────────────────────

/// Holds pointers to all of the tree roots.
pub const ROOT_TREE_OBJECT_ID: u64 = 1;
/// Stores information about which extents are in use, and reference counts.
pub const EXTENT_TREE_OBJECT_ID: u64 = 2;
/// Stores translations from logical to physical block numbering.
pub const CHUNK_TREE_OBJECT_ID: u64 = 3;
/// Stores information about which areas of a given device are in use.
pub const DEV_TREE_OBJECT_ID: u64 = 4;
/// One per subvolume, storing files and directories.
pub const FS_TREE_OBJECT_ID: u64 = 5;
/// Directory objectid inside the root tree.
pub const ROOT_TREE_DIR_OBJECT_ID: u64 = 6;
/// Holds checksums of all the data extents.
pub const CSUM_TREE_OBJECT_ID: u64 = 7;
/// Holds quota configuration and tracking.
pub const QUOTA_TREE_OBJECT_ID: u64 = 8;
/// For storing items that use the UUID key types.
pub const UUID_TREE_OBJECT_ID: u64 = 9;
/// Tracks free space in block groups.
pub const FREE_SPACE_TREE_OBJECT_ID: u64 = 10;

/// Device stats in the device tree.
pub const DEV_STATS_OBJECT_ID: u64 = 0;
/// For storing balance parameters in the root tree.
pub const BALANCE_OBJECT_ID: u64 = 0_u64.wrapping_sub(4);
/// Orphan objectid for tracking unlinked/truncated files.
pub const ORPHAN_OBJECT_ID: u64 = 0_u64.wrapping_sub(5);
/// Does write ahead logging to speed up fsyncs.
pub const TREE_LOG_OBJECT_ID: u64 = 0_u64.wrapping_sub(6);
pub const TREE_LOG_FIXUP_OBJECT_ID: u64 = 0_u64.wrapping_sub(7);
/// For space balancing.
pub const TREE_RELOC_OBJECT_ID: u64 = 0_u64.wrapping_sub(8);
pub const DATA_RELOC_TREE_OBJECT_ID: u64 = 0_u64.wrapping_sub(9);
/// Extent checksums all have this objectid.
pub const EXTENT_CSUM_OBJECT_ID: u64 = 0_u64.wrapping_sub(10);
/// For storing free space cache.
pub const FREE_SPACE_OBJECT_ID: u64 = 0_u64.wrapping_sub(11);
/// The special inode for storing free inode cache.
pub const FREE_INO_OBJECT_ID: u64 = 0_u64.wrapping_sub(12);
/// Dummy objectid representing multiple objectids.
pub const MULTIPLE_OBJECT_IDS: u64 = 0_u64.wrapping_sub(255);

/// All files have objectids in this range.
pub const FIRST_FREE_OBJECT_ID: u64 = 256;
pub const LAST_FREE_OBJECT_ID: u64 = 0_u64.wrapping_sub(256);
pub const FIRST_CHUNK_TREE_OBJECT_ID: u64 = 256;

/// The device items go into the chunk tree.
pub const DEV_ITEMS_OBJECT_ID: u64 = 1;

// ── Key types ───────────────────────────────────────────────────────────────

/// Stat-like data; one for every file and directory.
pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const INODE_EXTREF_KEY: u8 = 13;
pub const XATTR_ITEM_KEY: u8 = 24;
pub const ORPHAN_ITEM_KEY: u8 = 48;

pub const DIR_LOG_ITEM_KEY: u8 = 60;
pub const DIR_LOG_INDEX_KEY: u8 = 72;
/// Name → inode pointers in a directory, keyed by name hash.
pub const DIR_ITEM_KEY: u8 = 84;
/// Name → inode pointers in a directory, keyed by insertion sequence.
pub const DIR_INDEX_KEY: u8 = 96;

/// Extent data is for file data.
pub const EXTENT_DATA_KEY: u8 = 108;
/// Checksums for an entire extent on disk.
pub const EXTENT_CSUM_KEY: u8 = 128;

/// Root items point to tree roots.
pub const ROOT_ITEM_KEY: u8 = 132;
/// Root backrefs tie subvols and snapshots to their referencing dir entries.
pub const ROOT_BACKREF_KEY: u8 = 144;
/// Fast index for listing the subvolumes referenced by a given root.
pub const ROOT_REF_KEY: u8 = 156;

/// Records which blocks are in use and how many references each has.
pub const EXTENT_ITEM_KEY: u8 = 168;
/// Like `EXTENT_ITEM_KEY` for metadata, with the level in the key offset.
pub const METADATA_ITEM_KEY: u8 = 169;

pub const TREE_BLOCK_REF_KEY: u8 = 176;
pub const EXTENT_DATA_REF_KEY: u8 = 178;
pub const EXTENT_REF_V0_KEY: u8 = 180;
pub const SHARED_BLOCK_REF_KEY: u8 = 182;
pub const SHARED_DATA_REF_KEY: u8 = 184;

/// Hints into the extent allocation trees.
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const FREE_SPACE_INFO_KEY: u8 = 198;
pub const FREE_SPACE_EXTENT_KEY: u8 = 199;
pub const FREE_SPACE_BITMAP_KEY: u8 = 200;

pub const DEV_EXTENT_KEY: u8 = 204;
pub const DEV_ITEM_KEY: u8 = 216;
pub const CHUNK_ITEM_KEY: u8 = 228;

pub const QGROUP_STATUS_KEY: u8 = 240;
pub const QGROUP_INFO_KEY: u8 = 242;
pub const QGROUP_LIMIT_KEY: u8 = 244;
pub const QGROUP_RELATION_KEY: u8 = 246;
pub const TEMPORARY_ITEM_KEY: u8 = 248;
pub const PERSISTENT_ITEM_KEY: u8 = 249;
pub const DEV_REPLACE_KEY: u8 = 250;
pub const UUID_KEY_SUBVOL: u8 = 251;
pub const UUID_KEY_RECEIVED_SUBVOL: u8 = 252;
/// String items are for debugging only.
pub const STRING_ITEM_KEY: u8 = 253;

// ── Keys ────────────────────────────────────────────────────────────────────

/// Size of a disk key: objectid (8) + type (1) + offset (8).
pub const KEY_LEN: usize = 17;

/// A btrfs key names one filesystem object.
///
/// The sort order is unusual and load-bearing: `item_type` is the most
/// significant field, then `object_id`, then `offset`. This groups all items
/// of one type together across object ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub object_id: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[must_use]
    pub fn new(object_id: u64, item_type: u8, offset: u64) -> Self {
        Self {
            object_id,
            item_type,
            offset,
        }
    }

    /// Decode a 17-byte little-endian disk key at `offset` within `data`.
    pub fn read_at(data: &[u8], offset: usize) -> Result<Self, scv_types::ParseError> {
        Ok(Self {
            object_id: scv_types::read_le_u64(data, offset)?,
            item_type: scv_types::read_u8(data, offset + 8)?,
            offset: scv_types::read_le_u64(data, offset + 9)?,
        })
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item_type
            .cmp(&other.item_type)
            .then(self.object_id.cmp(&other.object_id))
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} {} {})",
            object_id_name(self.object_id),
            key_type_name(self.item_type),
            self.offset
        )
    }
}

#[allow(clippy::cast_possible_truncation)] // first argument is a key type byte
fn key_fill(key: &mut Key, args: &[u64]) {
    assert!(args.len() <= 3, "key builders take at most three arguments");
    if let Some(&item_type) = args.first() {
        key.item_type = item_type as u8;
    }
    if let Some(&object_id) = args.get(1) {
        key.object_id = object_id;
    }
    if let Some(&offset) = args.get(2) {
        key.offset = offset;
    }
}

/// Build the lower fence post of a key range. Arguments are interpreted in
/// order as `(type, object_id, offset)`; omitted fields stay zero.
#[must_use]
pub fn key_first(args: &[u64]) -> Key {
    let mut key = Key::default();
    key_fill(&mut key, args);
    key
}

/// Build the upper fence post of a key range. Arguments are interpreted in
/// order as `(type, object_id, offset)`; omitted fields default to their
/// maximum, with `object_id` topping out at `LAST_FREE_OBJECT_ID`.
#[must_use]
pub fn key_last(args: &[u64]) -> Key {
    let mut key = Key {
        object_id: LAST_FREE_OBJECT_ID,
        item_type: u8::MAX,
        offset: u64::MAX,
    };
    key_fill(&mut key, args);
    key
}

// ── Name hashing ────────────────────────────────────────────────────────────

/// CRC32C (Castagnoli) hash of a directory entry name as btrfs computes it:
/// the initial CRC is `!1` and the end result is *not* inverted.
#[must_use]
pub fn name_hash(name: &[u8]) -> u32 {
    !crc32c::crc32c_append(!0xFFFF_FFFE, name)
}

// ── Directory entry types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirEntryType {
    Unknown,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
    Xattr,
}

impl DirEntryType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::RegularFile,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            8 => Self::Xattr,
            _ => Self::Unknown,
        }
    }

    /// One-character type marker as printed by `ls -l`.
    #[must_use]
    pub fn list_marker(self) -> char {
        match self {
            Self::RegularFile => '-',
            Self::Directory => 'd',
            Self::CharDevice => 'c',
            Self::BlockDevice => 'b',
            Self::Fifo => 'p',
            Self::Socket => 's',
            Self::Symlink => 'l',
            Self::Unknown | Self::Xattr => '?',
        }
    }
}

// ── Human-readable names ────────────────────────────────────────────────────

/// Well-known object id name, or the decimal id.
#[must_use]
pub fn object_id_name(id: u64) -> String {
    let name = match id {
        ROOT_TREE_OBJECT_ID => "ROOT_TREE",
        EXTENT_TREE_OBJECT_ID => "EXTENT_TREE",
        CHUNK_TREE_OBJECT_ID => "CHUNK_TREE",
        DEV_TREE_OBJECT_ID => "DEV_TREE",
        FS_TREE_OBJECT_ID => "FS_TREE",
        ROOT_TREE_DIR_OBJECT_ID => "ROOT_TREE_DIR",
        CSUM_TREE_OBJECT_ID => "CSUM_TREE",
        QUOTA_TREE_OBJECT_ID => "QUOTA_TREE",
        UUID_TREE_OBJECT_ID => "UUID_TREE",
        FREE_SPACE_TREE_OBJECT_ID => "FREE_SPACE_TREE",
        BALANCE_OBJECT_ID => "BALANCE",
        ORPHAN_OBJECT_ID => "ORPHAN",
        TREE_LOG_OBJECT_ID => "TREE_LOG",
        TREE_LOG_FIXUP_OBJECT_ID => "TREE_LOG_FIXUP",
        TREE_RELOC_OBJECT_ID => "TREE_RELOC",
        DATA_RELOC_TREE_OBJECT_ID => "DATA_RELOC_TREE",
        EXTENT_CSUM_OBJECT_ID => "EXTENT_CSUM",
        FREE_SPACE_OBJECT_ID => "FREE_SPACE",
        FREE_INO_OBJECT_ID => "FREE_INO",
        MULTIPLE_OBJECT_IDS => "MULTIPLES",
        FIRST_FREE_OBJECT_ID => "FIRST_FREE",
        LAST_FREE_OBJECT_ID => "LAST_FREE",
        _ => return id.to_string(),
    };
    name.to_owned()
}

/// Well-known key type name, or the decimal type.
#[must_use]
pub fn key_type_name(item_type: u8) -> String {
    let name = match item_type {
        INODE_ITEM_KEY => "INODE_ITEM",
        INODE_REF_KEY => "INODE_REF",
        INODE_EXTREF_KEY => "INODE_EXTREF",
        XATTR_ITEM_KEY => "XATTR_ITEM",
        ORPHAN_ITEM_KEY => "ORPHAN_ITEM",
        DIR_LOG_ITEM_KEY => "DIR_LOG_ITEM",
        DIR_LOG_INDEX_KEY => "DIR_LOG_INDEX",
        DIR_ITEM_KEY => "DIR_ITEM",
        DIR_INDEX_KEY => "DIR_INDEX",
        EXTENT_DATA_KEY => "EXTENT_DATA",
        EXTENT_CSUM_KEY => "EXTENT_CSUM",
        ROOT_ITEM_KEY => "ROOT_ITEM",
        ROOT_BACKREF_KEY => "ROOT_BACKREF",
        ROOT_REF_KEY => "ROOT_REF",
        EXTENT_ITEM_KEY => "EXTENT_ITEM",
        METADATA_ITEM_KEY => "METADATA_ITEM",
        TREE_BLOCK_REF_KEY => "TREE_BLOCK_REF",
        EXTENT_DATA_REF_KEY => "EXTENT_DATA_REF",
        EXTENT_REF_V0_KEY => "EXTENT_REF_V0",
        SHARED_BLOCK_REF_KEY => "SHARED_BLOCK_REF",
        SHARED_DATA_REF_KEY => "SHARED_DATA_REF",
        BLOCK_GROUP_ITEM_KEY => "BLOCK_GROUP_ITEM",
        FREE_SPACE_INFO_KEY => "FREE_SPACE_INFO",
        FREE_SPACE_EXTENT_KEY => "FREE_SPACE_EXTENT",
        FREE_SPACE_BITMAP_KEY => "FREE_SPACE_BITMAP",
        DEV_EXTENT_KEY => "DEV_EXTENT",
        DEV_ITEM_KEY => "DEV_ITEM",
        CHUNK_ITEM_KEY => "CHUNK_ITEM",
        QGROUP_STATUS_KEY => "QGROUP_STATUS",
        QGROUP_INFO_KEY => "QGROUP_INFO",
        QGROUP_LIMIT_KEY => "QGROUP_LIMIT",
        QGROUP_RELATION_KEY => "QGROUP_RELATION",
        TEMPORARY_ITEM_KEY => "TEMPORARY_ITEM",
        PERSISTENT_ITEM_KEY => "PERSISTENT_ITEM",
        DEV_REPLACE_KEY => "DEV_REPLACE",
        UUID_KEY_SUBVOL => "UUID_SUBVOL",
        UUID_KEY_RECEIVED_SUBVOL => "UUID_RECEIVED_SUBVOL",
        STRING_ITEM_KEY => "STRING_ITEM",
        _ => return item_type.to_string(),
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bitwise CRC32C reference: raw reflected update (poly 0x82F63B78),
    /// no init or final inversion applied outside the given state.
    fn crc32c_reference(mut state: u32, data: &[u8]) -> u32 {
        for &byte in data {
            state ^= u32::from(byte);
            for _ in 0..8 {
                state = if state & 1 != 0 {
                    (state >> 1) ^ 0x82F6_3B78
                } else {
                    state >> 1
                };
            }
        }
        state
    }

    #[test]
    fn key_compare_is_total_order() {
        let low = Key::new(ROOT_TREE_DIR_OBJECT_ID, DIR_ITEM_KEY, 0);
        let high = Key::new(FIRST_FREE_OBJECT_ID, EXTENT_ITEM_KEY, 100);
        assert!(low < high);
        assert!(high > low);
        assert_eq!(low.cmp(&low), Ordering::Equal);
    }

    #[test]
    fn key_compare_type_most_significant() {
        // A higher type wins even against a much larger object id.
        let a = Key::new(u64::MAX, INODE_ITEM_KEY, u64::MAX);
        let b = Key::new(0, DIR_ITEM_KEY, 0);
        assert!(a < b);

        // Same type: object id decides.
        let c = Key::new(1, DIR_ITEM_KEY, u64::MAX);
        let d = Key::new(2, DIR_ITEM_KEY, 0);
        assert!(c < d);

        // Same type and object id: offset decides.
        let e = Key::new(2, DIR_ITEM_KEY, 1);
        let f = Key::new(2, DIR_ITEM_KEY, 2);
        assert!(e < f);
    }

    #[test]
    fn key_compare_antisymmetric() {
        let a = Key::new(10, 50, 7);
        let b = Key::new(11, 50, 3);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn key_builders_fill_in_argument_order() {
        assert_eq!(key_first(&[]), Key::default());
        assert_eq!(
            key_first(&[u64::from(DIR_ITEM_KEY), 256, 99]),
            Key::new(256, DIR_ITEM_KEY, 99)
        );
        assert_eq!(
            key_last(&[u64::from(DIR_ITEM_KEY), 256]),
            Key::new(256, DIR_ITEM_KEY, u64::MAX)
        );
        assert_eq!(
            key_last(&[]),
            Key::new(LAST_FREE_OBJECT_ID, u8::MAX, u64::MAX)
        );
    }

    #[test]
    fn key_first_below_key_last_for_non_sentinel_types() {
        for t in [
            u64::from(INODE_ITEM_KEY),
            u64::from(DIR_ITEM_KEY),
            u64::from(CHUNK_ITEM_KEY),
        ] {
            assert!(key_first(&[t]) < key_last(&[t]));
        }
        // The all-max sentinel is equal to itself.
        assert_eq!(key_last(&[]).cmp(&key_last(&[])), Ordering::Equal);
    }

    #[test]
    fn key_round_trips_through_disk_encoding() {
        let mut buf = [0_u8; KEY_LEN];
        buf[0..8].copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
        buf[8] = EXTENT_DATA_KEY;
        buf[9..17].copy_from_slice(&42_u64.to_le_bytes());
        let key = Key::read_at(&buf, 0).expect("key");
        assert_eq!(key, Key::new(0xDEAD_BEEF, EXTENT_DATA_KEY, 42));
        assert!(Key::read_at(&buf[..10], 0).is_err());
    }

    #[test]
    fn name_hash_of_empty_is_not_inverted_seed() {
        // With no input bytes the hash is the (un-inverted) seed, ~1.
        assert_eq!(name_hash(b""), 0xFFFF_FFFE);
    }

    #[test]
    fn name_hash_matches_bitwise_reference() {
        for name in [
            b"btrfs".as_slice(),
            b"default",
            b"file.zip",
            b"..",
            b"a-rather-long-directory-entry-name",
        ] {
            assert_eq!(
                name_hash(name),
                crc32c_reference(0xFFFF_FFFE, name),
                "hash mismatch for {name:?}"
            );
        }
    }

    #[test]
    fn dir_entry_type_mapping() {
        assert_eq!(DirEntryType::from_raw(1), DirEntryType::RegularFile);
        assert_eq!(DirEntryType::from_raw(2), DirEntryType::Directory);
        assert_eq!(DirEntryType::from_raw(7), DirEntryType::Symlink);
        assert_eq!(DirEntryType::from_raw(8), DirEntryType::Xattr);
        assert_eq!(DirEntryType::from_raw(0), DirEntryType::Unknown);
        assert_eq!(DirEntryType::from_raw(200), DirEntryType::Unknown);
        assert_eq!(DirEntryType::Directory.list_marker(), 'd');
        assert_eq!(DirEntryType::RegularFile.list_marker(), '-');
    }

    #[test]
    fn object_id_and_key_type_names() {
        assert_eq!(object_id_name(FS_TREE_OBJECT_ID), "FS_TREE");
        assert_eq!(object_id_name(4711), "4711");
        assert_eq!(key_type_name(DIR_ITEM_KEY), "DIR_ITEM");
        assert_eq!(key_type_name(2), "2");
        assert_eq!(
            Key::new(ROOT_TREE_DIR_OBJECT_ID, DIR_ITEM_KEY, 7).to_string(),
            "(ROOT_TREE_DIR DIR_ITEM 7)"
        );
    }
}

//! Zero-copy decoder for tree blocks.
//!
//! A leaf is a block-sized buffer: a fixed header, a table of item directory
//! entries growing forward, and item data growing backward from the end of
//! the block. Every view here aliases the caller's buffer; nothing is copied.

use crate::{KEY_LEN, Key};
use scv_types::{ParseError, UUID_SIZE, ensure_slice};
use uuid::Uuid;

/// Header layout offsets.
const HEADER_CSUM: usize = 0;
const HEADER_FSID: usize = HEADER_CSUM + scv_types::CSUM_SIZE;
const HEADER_BYTE_NR: usize = HEADER_FSID + UUID_SIZE;
const HEADER_FLAGS: usize = HEADER_BYTE_NR + 8;
const HEADER_CHUNK_TREE_UUID: usize = HEADER_FLAGS + 8;
const HEADER_GENERATION: usize = HEADER_CHUNK_TREE_UUID + UUID_SIZE;
const HEADER_OWNER: usize = HEADER_GENERATION + 8;
const HEADER_NR_ITEMS: usize = HEADER_OWNER + 8;
const HEADER_LEVEL: usize = HEADER_NR_ITEMS + 4;

/// Size of the tree block header.
pub const HEADER_LEN: usize = HEADER_LEVEL + 1;

/// Item directory entry layout offsets.
const ITEM_KEY: usize = 0;
const ITEM_OFFSET: usize = ITEM_KEY + KEY_LEN;
const ITEM_SIZE: usize = ITEM_OFFSET + 4;

/// Size of one item directory entry.
pub const ITEM_LEN: usize = ITEM_SIZE + 4;

// After `Header::new` validates the minimum length, fixed-offset reads
// below stay within the checked bound and index directly.
fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn le_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}

fn uuid_at(data: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0_u8; UUID_SIZE];
    bytes.copy_from_slice(&data[offset..offset + UUID_SIZE]);
    Uuid::from_bytes(bytes)
}

/// View of a tree block header.
#[derive(Debug, Clone, Copy)]
pub struct Header<'a> {
    block: &'a [u8],
}

impl<'a> Header<'a> {
    pub fn new(block: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, HEADER_LEN)?;
        Ok(Self { block })
    }

    #[must_use]
    pub fn csum(&self) -> &'a [u8] {
        &self.block[HEADER_CSUM..HEADER_CSUM + scv_types::CSUM_SIZE]
    }

    /// The filesystem-specific UUID shared by every block of one filesystem.
    #[must_use]
    pub fn fsid(&self) -> Uuid {
        uuid_at(self.block, HEADER_FSID)
    }

    /// The start of this block relative to the beginning of the device.
    #[must_use]
    pub fn byte_nr(&self) -> u64 {
        le_u64(self.block, HEADER_BYTE_NR)
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        le_u64(self.block, HEADER_FLAGS)
    }

    #[must_use]
    pub fn chunk_tree_uuid(&self) -> Uuid {
        uuid_at(self.block, HEADER_CHUNK_TREE_UUID)
    }

    /// The transaction generation in which this block was last written.
    #[must_use]
    pub fn generation(&self) -> u64 {
        le_u64(self.block, HEADER_GENERATION)
    }

    /// The id of the tree this block belongs to.
    #[must_use]
    pub fn owner(&self) -> u64 {
        le_u64(self.block, HEADER_OWNER)
    }

    #[must_use]
    pub fn nr_items(&self) -> u32 {
        le_u32(self.block, HEADER_NR_ITEMS)
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.block[HEADER_LEVEL]
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }
}

/// View of one 25-byte item directory entry.
#[derive(Debug, Clone, Copy)]
pub struct Item<'a> {
    raw: &'a [u8],
}

impl<'a> Item<'a> {
    /// View a 25-byte item directory entry stored outside a leaf, e.g. in
    /// the persistent index.
    pub fn from_raw(raw: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(raw, 0, ITEM_LEN)?;
        Ok(Self {
            raw: &raw[..ITEM_LEN],
        })
    }

    /// The key this item is stored under.
    #[must_use]
    pub fn key(&self) -> Key {
        Key {
            object_id: le_u64(self.raw, ITEM_KEY),
            item_type: self.raw[ITEM_KEY + 8],
            offset: le_u64(self.raw, ITEM_KEY + 9),
        }
    }

    /// Back-offset of the item data, relative to the end of the header.
    #[must_use]
    pub fn offset(&self) -> u32 {
        le_u32(self.raw, ITEM_OFFSET)
    }

    /// Length of the item data in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        le_u32(self.raw, ITEM_SIZE)
    }

    /// The raw 25 directory entry bytes, as stored in the leaf.
    #[must_use]
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }
}

/// View of a whole leaf block.
#[derive(Debug, Clone, Copy)]
pub struct Leaf<'a> {
    block: &'a [u8],
}

impl<'a> Leaf<'a> {
    pub fn new(block: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, HEADER_LEN)?;
        Ok(Self { block })
    }

    #[must_use]
    pub fn header(&self) -> Header<'a> {
        Header { block: self.block }
    }

    /// Number of items, clamped to what the block's item table can hold so a
    /// corrupted `nr_items` cannot push reads past the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        let capacity = (self.block.len() - HEADER_LEN) / ITEM_LEN;
        (self.header().nr_items() as usize).min(capacity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The i-th item directory entry. `i` must be below `len()`.
    #[must_use]
    pub fn item(&self, i: usize) -> Item<'a> {
        let start = HEADER_LEN + i * ITEM_LEN;
        Item {
            raw: &self.block[start..start + ITEM_LEN],
        }
    }

    /// The i-th item's key. `i` must be below `len()`.
    #[must_use]
    pub fn key(&self, i: usize) -> Key {
        self.item(i).key()
    }

    /// The i-th item's data slice, clamped to the block so corrupt offsets
    /// and sizes cannot reach outside the buffer.
    #[must_use]
    pub fn data(&self, i: usize) -> &'a [u8] {
        let item = self.item(i);
        let start = HEADER_LEN
            .saturating_add(item.offset() as usize)
            .min(self.block.len());
        let end = start
            .saturating_add(item.size() as usize)
            .min(self.block.len());
        &self.block[start..end]
    }

    /// Iterate over the item directory entries.
    pub fn items(&self) -> impl Iterator<Item = Item<'a>> + '_ {
        (0..self.len()).map(|i| self.item(i))
    }
}

//! Typed zero-copy views over item payloads.
//!
//! The index stores item payloads as opaque bytes; these views decode fields
//! on demand, dispatched on the key's type byte. Constructors validate the
//! fixed-length prefix once, so field accessors never read out of bounds.
//! Variable-length tails (names, inline data, stripe arrays) clamp to both
//! their declared length and the payload slice.

use crate::{
    BLOCK_GROUP_ITEM_KEY, CHUNK_ITEM_KEY, DEV_EXTENT_KEY, DEV_ITEM_KEY, DIR_INDEX_KEY,
    DIR_ITEM_KEY, DirEntryType, EXTENT_CSUM_KEY, EXTENT_DATA_KEY, EXTENT_ITEM_KEY,
    INODE_ITEM_KEY, INODE_REF_KEY, KEY_LEN, Key, METADATA_ITEM_KEY, ROOT_BACKREF_KEY,
    ROOT_ITEM_KEY, ROOT_REF_KEY, XATTR_ITEM_KEY,
};
use scv_types::{ParseError, Timespec, UUID_SIZE, ensure_slice};
use uuid::Uuid;

/// On-disk names clamp to this many bytes regardless of the stored length.
pub const MAX_NAME_LEN: usize = 255;

fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

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

fn timespec_at(data: &[u8], offset: usize) -> Timespec {
    Timespec::read_at(data, offset).unwrap_or_default()
}

/// Clamp a declared tail length to a hard limit and the available bytes.
fn clamped_tail(data: &[u8], start: usize, declared: usize, limit: usize) -> &[u8] {
    let start = start.min(data.len());
    let len = declared.min(limit).min(data.len() - start);
    &data[start..start + len]
}

// ── InodeItem ───────────────────────────────────────────────────────────────

/// Stat-like inode attributes. Keyed by `(inode, INODE_ITEM, 0)`.
#[derive(Debug, Clone, Copy)]
pub struct InodeItem<'a> {
    data: &'a [u8],
}

impl<'a> InodeItem<'a> {
    pub const FIXED_LEN: usize = 160;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    /// NFS style generation number.
    #[must_use]
    pub fn generation(&self) -> u64 {
        le_u64(self.data, 0)
    }

    /// Transid that last touched this inode.
    #[must_use]
    pub fn transid(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        le_u64(self.data, 16)
    }

    #[must_use]
    pub fn nbytes(&self) -> u64 {
        le_u64(self.data, 24)
    }

    #[must_use]
    pub fn block_group(&self) -> u64 {
        le_u64(self.data, 32)
    }

    #[must_use]
    pub fn nlink(&self) -> u32 {
        le_u32(self.data, 40)
    }

    #[must_use]
    pub fn uid(&self) -> u32 {
        le_u32(self.data, 44)
    }

    #[must_use]
    pub fn gid(&self) -> u32 {
        le_u32(self.data, 48)
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        le_u32(self.data, 52)
    }

    #[must_use]
    pub fn rdev(&self) -> u64 {
        le_u64(self.data, 56)
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        le_u64(self.data, 64)
    }

    /// Modification sequence number for NFS.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        le_u64(self.data, 72)
    }

    #[must_use]
    pub fn atime(&self) -> Timespec {
        timespec_at(self.data, 112)
    }

    #[must_use]
    pub fn ctime(&self) -> Timespec {
        timespec_at(self.data, 124)
    }

    #[must_use]
    pub fn mtime(&self) -> Timespec {
        timespec_at(self.data, 136)
    }

    #[must_use]
    pub fn otime(&self) -> Timespec {
        timespec_at(self.data, 148)
    }
}

// ── InodeRef ────────────────────────────────────────────────────────────────

/// Backlink from an inode to a parent directory, carrying the filename.
/// Keyed by `(inode, INODE_REF, parent_inode)`.
#[derive(Debug, Clone, Copy)]
pub struct InodeRef<'a> {
    data: &'a [u8],
}

impl<'a> InodeRef<'a> {
    pub const FIXED_LEN: usize = 10;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    /// Position of this entry within the parent directory.
    #[must_use]
    pub fn index(&self) -> u64 {
        le_u64(self.data, 0)
    }

    #[must_use]
    pub fn name_len(&self) -> u16 {
        le_u16(self.data, 8)
    }

    #[must_use]
    pub fn name_bytes(&self) -> &'a [u8] {
        clamped_tail(
            self.data,
            Self::FIXED_LEN,
            usize::from(self.name_len()),
            MAX_NAME_LEN,
        )
    }

    #[must_use]
    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }
}

// ── DirItem ─────────────────────────────────────────────────────────────────

/// A name → inode entry inside a directory. Shared by `DIR_ITEM` (keyed by
/// name hash), `DIR_INDEX` (keyed by sequence) and `XATTR_ITEM`.
#[derive(Debug, Clone, Copy)]
pub struct DirItem<'a> {
    data: &'a [u8],
}

impl<'a> DirItem<'a> {
    pub const FIXED_LEN: usize = KEY_LEN + 8 + 2 + 2 + 1;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    /// Key of the entry's target. A `ROOT_ITEM` location means the entry
    /// crosses into a subvolume.
    #[must_use]
    pub fn location(&self) -> Key {
        Key {
            object_id: le_u64(self.data, 0),
            item_type: self.data[8],
            offset: le_u64(self.data, 9),
        }
    }

    #[must_use]
    pub fn transid(&self) -> u64 {
        le_u64(self.data, KEY_LEN)
    }

    #[must_use]
    pub fn data_len(&self) -> u16 {
        le_u16(self.data, KEY_LEN + 8)
    }

    #[must_use]
    pub fn name_len(&self) -> u16 {
        le_u16(self.data, KEY_LEN + 10)
    }

    #[must_use]
    pub fn entry_type(&self) -> DirEntryType {
        DirEntryType::from_raw(self.data[KEY_LEN + 12])
    }

    #[must_use]
    pub fn name_bytes(&self) -> &'a [u8] {
        clamped_tail(
            self.data,
            Self::FIXED_LEN,
            usize::from(self.name_len()),
            MAX_NAME_LEN,
        )
    }

    #[must_use]
    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// Attached data (the value of an xattr entry), following the name.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        let start = Self::FIXED_LEN + self.name_bytes().len();
        clamped_tail(self.data, start, usize::from(self.data_len()), usize::MAX)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.entry_type() == DirEntryType::Directory
    }

    /// Whether following this entry crosses into a subvolume.
    #[must_use]
    pub fn is_subvolume(&self) -> bool {
        self.location().item_type == ROOT_ITEM_KEY
    }
}

// ── FileExtentItem ──────────────────────────────────────────────────────────

pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

/// Maps a byte range of a file to inline bytes or an on-disk extent.
/// Keyed by `(inode, EXTENT_DATA, file_offset)`.
#[derive(Debug, Clone, Copy)]
pub struct FileExtentItem<'a> {
    data: &'a [u8],
}

impl<'a> FileExtentItem<'a> {
    /// Length of the common prefix; inline extent data starts right after.
    pub const INLINE_DATA_OFFSET: usize = 21;
    /// Length of a regular (non-inline) extent record.
    pub const FIXED_LEN: usize = 53;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::INLINE_DATA_OFFSET)?;
        let item = Self { data };
        if !item.is_inline() {
            ensure_slice(data, 0, Self::FIXED_LEN)?;
        }
        Ok(item)
    }

    /// Transaction id that created this extent.
    #[must_use]
    pub fn generation(&self) -> u64 {
        le_u64(self.data, 0)
    }

    /// Upper limit on the decoded size of the extent in memory.
    #[must_use]
    pub fn ram_bytes(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn compression(&self) -> u8 {
        self.data[16]
    }

    #[must_use]
    pub fn encryption(&self) -> u8 {
        self.data[17]
    }

    #[must_use]
    pub fn other_encoding(&self) -> u16 {
        le_u16(self.data, 18)
    }

    #[must_use]
    pub fn extent_type(&self) -> u8 {
        self.data[20]
    }

    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.extent_type() == FILE_EXTENT_INLINE
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compression() != 0
    }

    /// Start of the on-disk extent in logical address space.
    /// Zero for inline extents.
    #[must_use]
    pub fn disk_byte_nr(&self) -> u64 {
        if self.is_inline() {
            0
        } else {
            le_u64(self.data, 21)
        }
    }

    /// Disk space consumed by the extent. Zero for inline extents.
    #[must_use]
    pub fn disk_num_bytes(&self) -> u64 {
        if self.is_inline() {
            0
        } else {
            le_u64(self.data, 29)
        }
    }

    /// Offset into the on-disk extent where this file range starts.
    /// Zero for inline extents.
    #[must_use]
    pub fn offset(&self) -> u64 {
        if self.is_inline() {
            0
        } else {
            le_u64(self.data, 37)
        }
    }

    /// Logical number of file bytes this record covers, always uncompressed.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        if self.is_inline() {
            self.inline_data().len() as u64
        } else {
            le_u64(self.data, 45)
        }
    }

    /// Inline file bytes; empty for regular extents.
    #[must_use]
    pub fn inline_data(&self) -> &'a [u8] {
        if !self.is_inline() {
            return &[];
        }
        let declared = usize::try_from(self.ram_bytes()).unwrap_or(usize::MAX);
        clamped_tail(self.data, Self::INLINE_DATA_OFFSET, declared, usize::MAX)
    }
}

// ── CsumItem ────────────────────────────────────────────────────────────────

/// Checksum run for a data extent. Only the raw bytes are retained; the
/// individual checksum array is not decoded.
#[derive(Debug, Clone, Copy)]
pub struct CsumItem<'a> {
    data: &'a [u8],
}

impl<'a> CsumItem<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, 1)?;
        Ok(Self { data })
    }

    #[must_use]
    pub fn first_byte(&self) -> u8 {
        self.data[0]
    }

    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }
}

// ── RootItem ────────────────────────────────────────────────────────────────

/// The head of a tree. Subvolumes and snapshots are `RootItem`s whose
/// object id lies in `[FIRST_FREE_OBJECT_ID, LAST_FREE_OBJECT_ID)`.
#[derive(Debug, Clone, Copy)]
pub struct RootItem<'a> {
    data: &'a [u8],
}

impl<'a> RootItem<'a> {
    pub const FIXED_LEN: usize = InodeItem::FIXED_LEN + 79;
    const V2_LEN: usize = Self::FIXED_LEN + 200;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    /// The embedded inode item describing the tree root directory.
    #[must_use]
    pub fn inode(&self) -> InodeItem<'a> {
        InodeItem {
            data: &self.data[..InodeItem::FIXED_LEN],
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        le_u64(self.data, 160)
    }

    #[must_use]
    pub fn root_dir_id(&self) -> u64 {
        le_u64(self.data, 168)
    }

    #[must_use]
    pub fn byte_nr(&self) -> u64 {
        le_u64(self.data, 176)
    }

    #[must_use]
    pub fn byte_limit(&self) -> u64 {
        le_u64(self.data, 184)
    }

    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        le_u64(self.data, 192)
    }

    #[must_use]
    pub fn last_snapshot(&self) -> u64 {
        le_u64(self.data, 200)
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        le_u64(self.data, 208)
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        le_u32(self.data, 216)
    }

    #[must_use]
    pub fn drop_progress(&self) -> Key {
        Key {
            object_id: le_u64(self.data, 220),
            item_type: self.data[228],
            offset: le_u64(self.data, 229),
        }
    }

    #[must_use]
    pub fn drop_level(&self) -> u8 {
        self.data[237]
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.data[238]
    }

    /// Generation copy used to validate the v2 tail; mismatching values mean
    /// an older kernel rewrote the item and the tail is stale.
    #[must_use]
    pub fn generation_v2(&self) -> Option<u64> {
        (self.data.len() >= Self::FIXED_LEN + 8).then(|| le_u64(self.data, 239))
    }

    fn has_v2_tail(&self) -> bool {
        self.data.len() >= Self::V2_LEN && self.generation_v2() == Some(self.generation())
    }

    #[must_use]
    pub fn uuid(&self) -> Option<Uuid> {
        self.has_v2_tail().then(|| uuid_at(self.data, 247))
    }

    #[must_use]
    pub fn parent_uuid(&self) -> Option<Uuid> {
        self.has_v2_tail().then(|| uuid_at(self.data, 263))
    }

    #[must_use]
    pub fn received_uuid(&self) -> Option<Uuid> {
        self.has_v2_tail().then(|| uuid_at(self.data, 279))
    }

    #[must_use]
    pub fn ctime(&self) -> Option<Timespec> {
        self.has_v2_tail().then(|| timespec_at(self.data, 327))
    }

    #[must_use]
    pub fn otime(&self) -> Option<Timespec> {
        self.has_v2_tail().then(|| timespec_at(self.data, 339))
    }
}

// ── RootRef ─────────────────────────────────────────────────────────────────

/// Forward or backward reference tying a subvolume to the directory entry
/// that names it.
#[derive(Debug, Clone, Copy)]
pub struct RootRef<'a> {
    data: &'a [u8],
}

impl<'a> RootRef<'a> {
    pub const FIXED_LEN: usize = 18;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    #[must_use]
    pub fn dir_id(&self) -> u64 {
        le_u64(self.data, 0)
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn name_len(&self) -> u16 {
        le_u16(self.data, 16)
    }

    #[must_use]
    pub fn name_bytes(&self) -> &'a [u8] {
        clamped_tail(
            self.data,
            Self::FIXED_LEN,
            usize::from(self.name_len()),
            MAX_NAME_LEN,
        )
    }

    #[must_use]
    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }
}

// ── ExtentItem ──────────────────────────────────────────────────────────────

pub const EXTENT_FLAG_DATA: u64 = 1;
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 2;

/// Reference count record in the extent tree. Very old filesystems carry a
/// 4-byte v0 layout holding only the reference count.
#[derive(Debug, Clone, Copy)]
pub struct ExtentItem<'a> {
    data: &'a [u8],
    compat_v0: bool,
}

impl<'a> ExtentItem<'a> {
    pub const FIXED_LEN: usize = 24;
    pub const V0_LEN: usize = 4;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() >= Self::FIXED_LEN {
            Ok(Self {
                data,
                compat_v0: false,
            })
        } else {
            ensure_slice(data, 0, Self::V0_LEN)?;
            Ok(Self {
                data,
                compat_v0: true,
            })
        }
    }

    #[must_use]
    pub fn is_compat_v0(&self) -> bool {
        self.compat_v0
    }

    #[must_use]
    pub fn refs(&self) -> u64 {
        if self.compat_v0 {
            u64::from(le_u32(self.data, 0))
        } else {
            le_u64(self.data, 0)
        }
    }

    /// Zero on v0 items, which predate the generation field.
    #[must_use]
    pub fn generation(&self) -> u64 {
        if self.compat_v0 {
            0
        } else {
            le_u64(self.data, 8)
        }
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        if self.compat_v0 {
            0
        } else {
            le_u64(self.data, 16)
        }
    }
}

// ── BlockGroupItem ──────────────────────────────────────────────────────────

pub const BLOCK_GROUP_DATA: u64 = 1;
pub const BLOCK_GROUP_SYSTEM: u64 = 2;
pub const BLOCK_GROUP_METADATA: u64 = 4;

/// Allocation hint for one block group.
#[derive(Debug, Clone, Copy)]
pub struct BlockGroupItem<'a> {
    data: &'a [u8],
}

impl<'a> BlockGroupItem<'a> {
    pub const FIXED_LEN: usize = 24;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        le_u64(self.data, 0)
    }

    #[must_use]
    pub fn chunk_object_id(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        le_u64(self.data, 16)
    }
}

// ── DevExtent ───────────────────────────────────────────────────────────────

/// Records an allocated area of one device, pointing back to the chunk that
/// owns it.
#[derive(Debug, Clone, Copy)]
pub struct DevExtent<'a> {
    data: &'a [u8],
}

impl<'a> DevExtent<'a> {
    pub const FIXED_LEN: usize = 48;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    #[must_use]
    pub fn chunk_tree(&self) -> u64 {
        le_u64(self.data, 0)
    }

    #[must_use]
    pub fn chunk_object_id(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn chunk_offset(&self) -> u64 {
        le_u64(self.data, 16)
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        le_u64(self.data, 24)
    }

    #[must_use]
    pub fn chunk_tree_uuid(&self) -> Uuid {
        uuid_at(self.data, 32)
    }
}

// ── DevItem ─────────────────────────────────────────────────────────────────

/// Describes one member device of the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct DevItem<'a> {
    data: &'a [u8],
}

impl<'a> DevItem<'a> {
    pub const FIXED_LEN: usize = 98;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    #[must_use]
    pub fn dev_id(&self) -> u64 {
        le_u64(self.data, 0)
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        le_u64(self.data, 16)
    }

    #[must_use]
    pub fn io_align(&self) -> u32 {
        le_u32(self.data, 24)
    }

    #[must_use]
    pub fn io_width(&self) -> u32 {
        le_u32(self.data, 28)
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        le_u32(self.data, 32)
    }

    #[must_use]
    pub fn dev_type(&self) -> u64 {
        le_u64(self.data, 36)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        le_u64(self.data, 44)
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        le_u64(self.data, 52)
    }

    #[must_use]
    pub fn dev_group(&self) -> u32 {
        le_u32(self.data, 60)
    }

    #[must_use]
    pub fn seek_speed(&self) -> u8 {
        self.data[64]
    }

    #[must_use]
    pub fn bandwidth(&self) -> u8 {
        self.data[65]
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        uuid_at(self.data, 66)
    }

    #[must_use]
    pub fn fsid(&self) -> Uuid {
        uuid_at(self.data, 82)
    }
}

// ── Chunk ───────────────────────────────────────────────────────────────────

/// One physical placement (device + offset) of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stripe {
    pub dev_id: u64,
    pub offset: u64,
    pub dev_uuid: Uuid,
}

/// Maps a range of logical address space to physical device placements.
/// The chunk's key offset is the logical start of the range.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    data: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub const FIXED_LEN: usize = 48;
    pub const STRIPE_LEN: usize = 32;

    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::FIXED_LEN)?;
        Ok(Self { data })
    }

    /// Size of this chunk's logical range in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        le_u64(self.data, 0)
    }

    /// Object id of the root referencing this chunk.
    #[must_use]
    pub fn owner(&self) -> u64 {
        le_u64(self.data, 8)
    }

    #[must_use]
    pub fn stripe_len(&self) -> u64 {
        le_u64(self.data, 16)
    }

    #[must_use]
    pub fn chunk_type(&self) -> u64 {
        le_u64(self.data, 24)
    }

    #[must_use]
    pub fn io_align(&self) -> u32 {
        le_u32(self.data, 32)
    }

    #[must_use]
    pub fn io_width(&self) -> u32 {
        le_u32(self.data, 36)
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        le_u32(self.data, 40)
    }

    /// Declared stripe count, clamped to the stripes the payload can hold.
    #[must_use]
    pub fn num_stripes(&self) -> usize {
        let declared = usize::from(le_u16(self.data, 44));
        let capacity = (self.data.len() - Self::FIXED_LEN) / Self::STRIPE_LEN;
        declared.min(capacity)
    }

    #[must_use]
    pub fn sub_stripes(&self) -> u16 {
        le_u16(self.data, 46)
    }

    /// The i-th stripe. `i` must be below `num_stripes()`.
    #[must_use]
    pub fn stripe(&self, i: usize) -> Stripe {
        let base = Self::FIXED_LEN + i * Self::STRIPE_LEN;
        Stripe {
            dev_id: le_u64(self.data, base),
            offset: le_u64(self.data, base + 8),
            dev_uuid: uuid_at(self.data, base + 16),
        }
    }

    pub fn stripes(&self) -> impl Iterator<Item = Stripe> + '_ {
        (0..self.num_stripes()).map(|i| self.stripe(i))
    }
}

// ── Access-time dispatch ────────────────────────────────────────────────────

/// A typed view over an item payload, selected by the key's type byte.
/// Types this crate does not decode stay available as raw bytes.
#[derive(Debug, Clone, Copy)]
pub enum ItemView<'a> {
    Inode(InodeItem<'a>),
    InodeRef(InodeRef<'a>),
    Dir(DirItem<'a>),
    FileExtent(FileExtentItem<'a>),
    Csum(CsumItem<'a>),
    Root(RootItem<'a>),
    RootRef(RootRef<'a>),
    Extent(ExtentItem<'a>),
    BlockGroup(BlockGroupItem<'a>),
    DevExtent(DevExtent<'a>),
    Dev(DevItem<'a>),
    Chunk(Chunk<'a>),
    Unknown(&'a [u8]),
}

/// Dispatch an item payload to its typed view based on the key type.
pub fn view_for(item_type: u8, data: &[u8]) -> Result<ItemView<'_>, ParseError> {
    Ok(match item_type {
        INODE_ITEM_KEY => ItemView::Inode(InodeItem::parse(data)?),
        INODE_REF_KEY => ItemView::InodeRef(InodeRef::parse(data)?),
        XATTR_ITEM_KEY | DIR_ITEM_KEY | DIR_INDEX_KEY => ItemView::Dir(DirItem::parse(data)?),
        EXTENT_DATA_KEY => ItemView::FileExtent(FileExtentItem::parse(data)?),
        EXTENT_CSUM_KEY => ItemView::Csum(CsumItem::parse(data)?),
        ROOT_ITEM_KEY => ItemView::Root(RootItem::parse(data)?),
        ROOT_BACKREF_KEY | ROOT_REF_KEY => ItemView::RootRef(RootRef::parse(data)?),
        EXTENT_ITEM_KEY | METADATA_ITEM_KEY => ItemView::Extent(ExtentItem::parse(data)?),
        BLOCK_GROUP_ITEM_KEY => ItemView::BlockGroup(BlockGroupItem::parse(data)?),
        DEV_EXTENT_KEY => ItemView::DevExtent(DevExtent::parse(data)?),
        DEV_ITEM_KEY => ItemView::Dev(DevItem::parse(data)?),
        CHUNK_ITEM_KEY => ItemView::Chunk(Chunk::parse(data)?),
        _ => ItemView::Unknown(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STRING_ITEM_KEY;
    use proptest::prelude::*;

    fn encode_dir_item(
        location: Key,
        transid: u64,
        entry_type: u8,
        name: &[u8],
        data: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&location.object_id.to_le_bytes());
        out.push(location.item_type);
        out.extend_from_slice(&location.offset.to_le_bytes());
        out.extend_from_slice(&transid.to_le_bytes());
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.push(entry_type);
        out.extend_from_slice(name);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn dir_item_decodes_name_and_target() {
        let raw = encode_dir_item(Key::new(257, INODE_ITEM_KEY, 0), 9, 2, b"src", b"");
        let item = DirItem::parse(&raw).expect("dir item");
        assert_eq!(item.location(), Key::new(257, INODE_ITEM_KEY, 0));
        assert_eq!(item.transid(), 9);
        assert_eq!(item.name(), "src");
        assert_eq!(item.entry_type(), DirEntryType::Directory);
        assert!(item.is_dir());
        assert!(!item.is_subvolume());
        assert!(item.data().is_empty());
    }

    #[test]
    fn dir_item_detects_subvolume_crossing() {
        let raw = encode_dir_item(Key::new(260, ROOT_ITEM_KEY, u64::MAX), 9, 2, b"snap", b"");
        let item = DirItem::parse(&raw).expect("dir item");
        assert!(item.is_subvolume());
    }

    #[test]
    fn dir_item_clamps_corrupt_name_len() {
        let mut raw = encode_dir_item(Key::new(257, INODE_ITEM_KEY, 0), 9, 1, b"name", b"");
        // Claim a 9999-byte name; only 4 bytes exist.
        raw[KEY_LEN + 10..KEY_LEN + 12].copy_from_slice(&9999_u16.to_le_bytes());
        let item = DirItem::parse(&raw).expect("dir item");
        assert_eq!(item.name(), "name");
    }

    #[test]
    fn xattr_item_carries_value_data() {
        let raw = encode_dir_item(
            Key::new(0, 0, 0),
            3,
            8,
            b"user.comment",
            b"recovered by scavenge",
        );
        let item = DirItem::parse(&raw).expect("xattr item");
        assert_eq!(item.name(), "user.comment");
        assert_eq!(item.data(), b"recovered by scavenge");
        assert_eq!(item.entry_type(), DirEntryType::Xattr);
    }

    fn encode_inode_item(size: u64, mode: u32, nlink: u32, uid: u32, gid: u32) -> Vec<u8> {
        let mut out = vec![0_u8; InodeItem::FIXED_LEN];
        out[16..24].copy_from_slice(&size.to_le_bytes());
        out[40..44].copy_from_slice(&nlink.to_le_bytes());
        out[44..48].copy_from_slice(&uid.to_le_bytes());
        out[48..52].copy_from_slice(&gid.to_le_bytes());
        out[52..56].copy_from_slice(&mode.to_le_bytes());
        // mtime: secs + nanos
        out[136..144].copy_from_slice(&1_600_000_000_u64.to_le_bytes());
        out[144..148].copy_from_slice(&77_u32.to_le_bytes());
        out
    }

    #[test]
    fn inode_item_decodes_stat_fields() {
        let raw = encode_inode_item(4096, 0o100_644, 2, 1000, 100);
        let inode = InodeItem::parse(&raw).expect("inode");
        assert_eq!(inode.size(), 4096);
        assert_eq!(inode.mode(), 0o100_644);
        assert_eq!(inode.nlink(), 2);
        assert_eq!(inode.uid(), 1000);
        assert_eq!(inode.gid(), 100);
        assert_eq!(inode.mtime().secs, 1_600_000_000);
        assert_eq!(inode.mtime().nanos, 77);
        assert!(InodeItem::parse(&raw[..100]).is_err());
    }

    #[test]
    fn inode_ref_name_clamps() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&3_u64.to_le_bytes());
        raw.extend_from_slice(&1000_u16.to_le_bytes());
        raw.extend_from_slice(b"short");
        let iref = InodeRef::parse(&raw).expect("inode ref");
        assert_eq!(iref.index(), 3);
        assert_eq!(iref.name(), "short");
    }

    fn encode_regular_extent(disk_byte_nr: u64, disk_num: u64, offset: u64, num: u64) -> Vec<u8> {
        let mut out = vec![0_u8; FileExtentItem::FIXED_LEN];
        out[20] = FILE_EXTENT_REG;
        out[21..29].copy_from_slice(&disk_byte_nr.to_le_bytes());
        out[29..37].copy_from_slice(&disk_num.to_le_bytes());
        out[37..45].copy_from_slice(&offset.to_le_bytes());
        out[45..53].copy_from_slice(&num.to_le_bytes());
        out
    }

    #[test]
    fn file_extent_regular_fields() {
        let raw = encode_regular_extent(0x40_0000, 8192, 512, 7000);
        let fe = FileExtentItem::parse(&raw).expect("extent");
        assert!(!fe.is_inline());
        assert_eq!(fe.disk_byte_nr(), 0x40_0000);
        assert_eq!(fe.disk_num_bytes(), 8192);
        assert_eq!(fe.offset(), 512);
        assert_eq!(fe.num_bytes(), 7000);
        assert!(fe.inline_data().is_empty());
    }

    #[test]
    fn file_extent_inline_data() {
        let payload = b"inline contents";
        let mut raw = vec![0_u8; FileExtentItem::INLINE_DATA_OFFSET];
        raw[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        raw[20] = FILE_EXTENT_INLINE;
        raw.extend_from_slice(payload);
        let fe = FileExtentItem::parse(&raw).expect("extent");
        assert!(fe.is_inline());
        assert_eq!(fe.inline_data(), payload);
        assert_eq!(fe.num_bytes(), payload.len() as u64);
        assert_eq!(fe.disk_byte_nr(), 0);
    }

    #[test]
    fn file_extent_regular_requires_full_record() {
        let mut raw = vec![0_u8; 30];
        raw[20] = FILE_EXTENT_REG;
        assert!(FileExtentItem::parse(&raw).is_err());
    }

    fn encode_chunk(length: u64, stripes: &[(u64, u64)]) -> Vec<u8> {
        let mut out = vec![0_u8; Chunk::FIXED_LEN];
        out[0..8].copy_from_slice(&length.to_le_bytes());
        out[44..46].copy_from_slice(&(stripes.len() as u16).to_le_bytes());
        for (dev_id, offset) in stripes {
            let mut stripe = vec![0_u8; Chunk::STRIPE_LEN];
            stripe[0..8].copy_from_slice(&dev_id.to_le_bytes());
            stripe[8..16].copy_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&stripe);
        }
        out
    }

    #[test]
    fn chunk_decodes_stripes() {
        let raw = encode_chunk(0x40_0000, &[(1, 0x100_0000), (2, 0x200_0000)]);
        let chunk = Chunk::parse(&raw).expect("chunk");
        assert_eq!(chunk.length(), 0x40_0000);
        assert_eq!(chunk.num_stripes(), 2);
        assert_eq!(chunk.stripe(0).dev_id, 1);
        assert_eq!(chunk.stripe(1).offset, 0x200_0000);
        assert_eq!(chunk.stripes().count(), 2);
    }

    #[test]
    fn chunk_clamps_stripe_count_to_payload() {
        let mut raw = encode_chunk(0x40_0000, &[(1, 0x100_0000)]);
        raw[44..46].copy_from_slice(&u16::MAX.to_le_bytes());
        let chunk = Chunk::parse(&raw).expect("chunk");
        assert_eq!(chunk.num_stripes(), 1);
    }

    #[test]
    fn extent_item_v0_compat() {
        let v0 = 5_u32.to_le_bytes();
        let item = ExtentItem::parse(&v0).expect("v0 extent");
        assert!(item.is_compat_v0());
        assert_eq!(item.refs(), 5);
        assert_eq!(item.generation(), 0);

        let mut full = vec![0_u8; ExtentItem::FIXED_LEN];
        full[0..8].copy_from_slice(&9_u64.to_le_bytes());
        full[8..16].copy_from_slice(&33_u64.to_le_bytes());
        let item = ExtentItem::parse(&full).expect("extent");
        assert!(!item.is_compat_v0());
        assert_eq!(item.refs(), 9);
        assert_eq!(item.generation(), 33);

        assert!(ExtentItem::parse(&[0_u8; 3]).is_err());
    }

    #[test]
    fn root_item_subvolume_fields() {
        let mut raw = vec![0_u8; RootItem::FIXED_LEN];
        raw[160..168].copy_from_slice(&88_u64.to_le_bytes());
        raw[168..176].copy_from_slice(&256_u64.to_le_bytes());
        raw[238] = 1;
        let root = RootItem::parse(&raw).expect("root");
        assert_eq!(root.generation(), 88);
        assert_eq!(root.root_dir_id(), 256);
        assert_eq!(root.level(), 1);
        // No v2 tail on the short record.
        assert_eq!(root.uuid(), None);
    }

    #[test]
    fn root_item_v2_tail_gated_on_generation_copy() {
        let mut raw = vec![0_u8; RootItem::FIXED_LEN + 200];
        raw[160..168].copy_from_slice(&88_u64.to_le_bytes());
        raw[239..247].copy_from_slice(&88_u64.to_le_bytes());
        raw[247..263].copy_from_slice(&[0xAB; 16]);
        let root = RootItem::parse(&raw).expect("root");
        assert_eq!(root.generation_v2(), Some(88));
        assert_eq!(root.uuid(), Some(Uuid::from_bytes([0xAB; 16])));

        // Stale tail: generation copy differs.
        raw[239..247].copy_from_slice(&87_u64.to_le_bytes());
        let root = RootItem::parse(&raw).expect("root");
        assert_eq!(root.uuid(), None);
    }

    #[test]
    fn root_ref_names_subvolume() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&256_u64.to_le_bytes());
        raw.extend_from_slice(&2_u64.to_le_bytes());
        raw.extend_from_slice(&4_u16.to_le_bytes());
        raw.extend_from_slice(b"snap");
        let rref = RootRef::parse(&raw).expect("root ref");
        assert_eq!(rref.dir_id(), 256);
        assert_eq!(rref.sequence(), 2);
        assert_eq!(rref.name(), "snap");
    }

    #[test]
    fn block_group_and_dev_items_decode() {
        let mut bg = vec![0_u8; BlockGroupItem::FIXED_LEN];
        bg[0..8].copy_from_slice(&12_345_u64.to_le_bytes());
        bg[16..24].copy_from_slice(&BLOCK_GROUP_DATA.to_le_bytes());
        let bg = BlockGroupItem::parse(&bg).expect("block group");
        assert_eq!(bg.used(), 12_345);
        assert_eq!(bg.flags(), BLOCK_GROUP_DATA);

        let mut dev = vec![0_u8; DevItem::FIXED_LEN];
        dev[0..8].copy_from_slice(&1_u64.to_le_bytes());
        dev[8..16].copy_from_slice(&(64_u64 << 30).to_le_bytes());
        dev[66..82].copy_from_slice(&[0x55; 16]);
        let dev = DevItem::parse(&dev).expect("dev item");
        assert_eq!(dev.dev_id(), 1);
        assert_eq!(dev.total_bytes(), 64 << 30);
        assert_eq!(dev.uuid(), Uuid::from_bytes([0x55; 16]));

        let mut ext = vec![0_u8; DevExtent::FIXED_LEN];
        ext[16..24].copy_from_slice(&0x100_0000_u64.to_le_bytes());
        ext[24..32].copy_from_slice(&0x40_0000_u64.to_le_bytes());
        let ext = DevExtent::parse(&ext).expect("dev extent");
        assert_eq!(ext.chunk_offset(), 0x100_0000);
        assert_eq!(ext.length(), 0x40_0000);
    }

    #[test]
    fn csum_item_keeps_raw_bytes() {
        let item = CsumItem::parse(&[0xAA, 0xBB, 0xCC]).expect("csum");
        assert_eq!(item.first_byte(), 0xAA);
        assert_eq!(item.bytes(), &[0xAA, 0xBB, 0xCC]);
        assert!(CsumItem::parse(&[]).is_err());
    }

    #[test]
    fn view_dispatch_by_key_type() {
        let dir = encode_dir_item(Key::new(257, INODE_ITEM_KEY, 0), 1, 1, b"f", b"");
        assert!(matches!(
            view_for(DIR_ITEM_KEY, &dir),
            Ok(ItemView::Dir(_))
        ));
        assert!(matches!(
            view_for(STRING_ITEM_KEY, b"anything"),
            Ok(ItemView::Unknown(_))
        ));
        assert!(view_for(INODE_ITEM_KEY, &[0_u8; 8]).is_err());
    }

    proptest! {
        #[test]
        fn views_never_panic(item_type in any::<u8>(), data in proptest::collection::vec(any::<u8>(), 0..=512)) {
            if let Ok(view) = view_for(item_type, &data) {
                match view {
                    ItemView::Inode(v) => { let _ = v.size(); let _ = v.mtime(); }
                    ItemView::InodeRef(v) => { let _ = v.name(); }
                    ItemView::Dir(v) => { let _ = v.name(); let _ = v.data(); let _ = v.location(); }
                    ItemView::FileExtent(v) => { let _ = v.inline_data(); let _ = v.disk_byte_nr(); let _ = v.num_bytes(); }
                    ItemView::Csum(v) => { let _ = v.first_byte(); }
                    ItemView::Root(v) => { let _ = v.uuid(); let _ = v.generation(); }
                    ItemView::RootRef(v) => { let _ = v.name(); }
                    ItemView::Extent(v) => { let _ = v.refs(); }
                    ItemView::BlockGroup(v) => { let _ = v.used(); }
                    ItemView::DevExtent(v) => { let _ = v.length(); }
                    ItemView::Dev(v) => { let _ = v.uuid(); }
                    ItemView::Chunk(v) => { for s in v.stripes() { let _ = s.dev_id; } }
                    ItemView::Unknown(bytes) => { let _ = bytes.len(); }
                }
            }
        }
    }
}

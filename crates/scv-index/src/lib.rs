#![forbid(unsafe_code)]
//! The persistent, generation-aware metadata index.
//!
//! Every filesystem item recovered from a leaf is stored in an embedded
//! ordered key-value store under the 33-byte big-endian key described in
//! [`key`]. Because the filesystem is copy-on-write, many generations of the
//! same logical object coexist on disk; the index keeps all of them and
//! resolves lookups against a caller-supplied generation ceiling.
//!
//! A writer and readers must not share one index file; callers serialize at
//! their level.

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use scv_error::{Result, ScvError, store_err};
use scv_ondisk::{
    CHUNK_ITEM_KEY, Chunk, DIR_INDEX_KEY, DIR_ITEM_KEY, DirItem, EXTENT_DATA_KEY,
    FIRST_CHUNK_TREE_OBJECT_ID, FIRST_FREE_OBJECT_ID, FileExtentItem, INODE_ITEM_KEY,
    INODE_REF_KEY, InodeItem, ITEM_LEN, Item, ItemView, Key, LAST_FREE_OBJECT_ID, ROOT_ITEM_KEY,
    ROOT_REF_KEY, ROOT_TREE_OBJECT_ID, RootItem, XATTR_ITEM_KEY, key_first, key_last, view_for,
};
use scv_types::ParseCursor;
use std::ops::Bound;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod key;
mod resolve;

pub use key::{GENERATION_OFFSET, INDEX_KEY_LEN, IndexKey, decode_v1, encode_v1};
pub use resolve::{ChunkMap, ChunkMapping, PathMatch};

const INDEX_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index");
const UPGRADE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("upgrade");

type IndexTable = redb::ReadOnlyTable<&'static [u8], &'static [u8]>;

/// Index schema version, bumped (as a decimal date) on incompatible changes.
pub const METADATA_VERSION: u64 = 20190809;

/// Inserts are batched into one write transaction; the transaction
/// auto-commits after this many inserts to bound memory.
const MAX_BATCHED_INSERTS: usize = 10_000;

/// The reserved metadata key. It sorts lexicographically last, so seeks over
/// real items never run off the end of the keyspace.
fn metadata_key() -> IndexKey {
    IndexKey::new(u64::MAX, key_last(&[]), u64::MAX)
}

/// Where the previous schema kept its metadata record.
fn metadata_key_v1() -> [u8; INDEX_KEY_LEN] {
    encode_v1(u64::MAX, key_last(&[]), u64::MAX)
}

/// Fetch the metadata record from a table, trying the current sentinel
/// location first and the previous layout's second.
fn load_metadata(table: &impl ReadableTable<&'static [u8], &'static [u8]>) -> Result<Option<IndexMetadata>> {
    if let Some(value) = table.get(metadata_key().as_slice()).map_err(store_err)? {
        return IndexMetadata::decode(value.value()).map(Some);
    }
    if let Some(value) = table.get(metadata_key_v1().as_slice()).map_err(store_err)? {
        return IndexMetadata::decode(value.value()).map(Some);
    }
    Ok(None)
}

// ── Metadata record ─────────────────────────────────────────────────────────

/// The metadata record stored under the sentinel key: schema version, the
/// block size the index was built for, the filesystem id, and the default
/// generation ceiling. Encoded little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMetadata {
    pub version: u64,
    pub block_size: u32,
    pub fsid: Uuid,
    pub generation: u64,
}

impl IndexMetadata {
    const ENCODED_LEN: usize = 8 + 4 + 16 + 8;

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(self.fsid.as_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = ParseCursor::new(bytes);
        let version = cur.next_u64()?;
        let block_size = cur.next_u32()?;
        let fsid = cur.next_uuid()?;
        let generation = cur.next_u64()?;
        Ok(Self {
            version,
            block_size,
            fsid,
            generation,
        })
    }
}

// ── Query results ───────────────────────────────────────────────────────────

/// One index entry: the owner tree, key and generation it is stored under,
/// plus the original 25-byte leaf item entry followed by its payload.
#[derive(Debug, Clone)]
pub struct IndexItem {
    owner: u64,
    key: Key,
    generation: u64,
    value: Vec<u8>,
}

impl IndexItem {
    fn from_entry(index_key: IndexKey, value: Vec<u8>) -> Result<Self> {
        if value.len() < ITEM_LEN {
            return Err(ScvError::Format(format!(
                "index value too short: {} bytes",
                value.len()
            )));
        }
        Ok(Self {
            owner: index_key.owner(),
            key: index_key.key(),
            generation: index_key.generation(),
            value,
        })
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner
    }

    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The leaf item directory entry this payload was stored with.
    pub fn item(&self) -> Result<Item<'_>> {
        Ok(Item::from_raw(&self.value)?)
    }

    /// The item payload, exactly as the leaf's data area held it.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let size = self
            .item()
            .map(|item| item.size() as usize)
            .unwrap_or_default();
        let end = ITEM_LEN.saturating_add(size).min(self.value.len());
        &self.value[ITEM_LEN..end]
    }

    /// Dispatch the payload to its typed view based on the key type.
    pub fn view(&self) -> Result<ItemView<'_>> {
        Ok(view_for(self.key.item_type, self.data())?)
    }

    #[must_use]
    pub fn as_dir_item(&self) -> Option<DirItem<'_>> {
        match self.view() {
            Ok(ItemView::Dir(item)) => Some(item),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_inode_item(&self) -> Option<InodeItem<'_>> {
        match self.view() {
            Ok(ItemView::Inode(item)) => Some(item),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_file_extent_item(&self) -> Option<FileExtentItem<'_>> {
        match self.view() {
            Ok(ItemView::FileExtent(item)) => Some(item),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_root_item(&self) -> Option<RootItem<'_>> {
        match self.view() {
            Ok(ItemView::Root(item)) => Some(item),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_chunk(&self) -> Option<Chunk<'_>> {
        match self.view() {
            Ok(ItemView::Chunk(item)) => Some(item),
            _ => None,
        }
    }
}

// ── Open options ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub block_size: u32,
    pub fsid: Uuid,
    /// Generation ceiling for lookups; `u64::MAX` means "newest".
    pub generation: u64,
    /// Accept an index written by an older schema so it can be upgraded.
    pub allow_old_version: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            block_size: scv_types::DEFAULT_BLOCK_SIZE,
            fsid: Uuid::nil(),
            generation: u64::MAX,
            allow_old_version: false,
        }
    }
}

// ── The index ───────────────────────────────────────────────────────────────

/// Handle to an index file.
///
/// Reads observe committed state only; a pending insert batch becomes
/// visible once `commit()` returns (or the handle is dropped).
pub struct Index {
    db: Database,
    txn: Option<WriteTransaction>,
    txn_inserts: usize,
    writable: bool,
    generation: u64,
    metadata: IndexMetadata,
}

impl Index {
    /// Open an index read-write, creating the file when missing. The stored
    /// metadata must match `options`; a fresh index records them.
    pub fn open(path: impl AsRef<Path>, options: &IndexOptions) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(store_err)?;
        let metadata = Self::check_update_metadata(&db, options)?;
        debug!(
            path = %path.as_ref().display(),
            version = metadata.version,
            block_size = metadata.block_size,
            "opened index read-write"
        );
        Ok(Self {
            db,
            txn: None,
            txn_inserts: 0,
            writable: true,
            generation: options.generation,
            metadata,
        })
    }

    /// Open an existing index for querying only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScvError::NotFound(path.display().to_string()));
        }
        let db = Database::open(path).map_err(store_err)?;
        let metadata = Self::read_metadata(&db)?;
        if metadata.version != METADATA_VERSION {
            return Err(ScvError::VersionMismatch {
                expected: METADATA_VERSION,
                actual: metadata.version,
            });
        }
        Ok(Self {
            db,
            txn: None,
            txn_inserts: 0,
            writable: false,
            generation: u64::MAX,
            metadata,
        })
    }

    /// Open read-write without geometry checks, accepting an older schema.
    /// The schema upgrade cannot know the stored fsid or block size upfront.
    pub fn open_for_upgrade(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScvError::NotFound(path.display().to_string()));
        }
        let db = Database::open(path).map_err(store_err)?;
        let metadata = Self::read_metadata(&db)?;
        if metadata.version > METADATA_VERSION {
            return Err(ScvError::VersionMismatch {
                expected: METADATA_VERSION,
                actual: metadata.version,
            });
        }
        Ok(Self {
            db,
            txn: None,
            txn_inserts: 0,
            writable: true,
            generation: u64::MAX,
            metadata,
        })
    }

    fn read_metadata(db: &Database) -> Result<IndexMetadata> {
        let txn = db.begin_read().map_err(store_err)?;
        let table = txn.open_table(INDEX_TABLE).map_err(store_err)?;
        load_metadata(&table)?.ok_or(ScvError::MissingMetadata)
    }

    fn check_update_metadata(db: &Database, options: &IndexOptions) -> Result<IndexMetadata> {
        let txn = db.begin_write().map_err(store_err)?;
        let metadata = {
            let mut table = txn.open_table(INDEX_TABLE).map_err(store_err)?;
            let existing = load_metadata(&table)?;

            match existing {
                None => {
                    let metadata = IndexMetadata {
                        version: METADATA_VERSION,
                        block_size: options.block_size,
                        fsid: options.fsid,
                        generation: options.generation,
                    };
                    table
                        .insert(metadata_key().as_slice(), metadata.encode().as_slice())
                        .map_err(store_err)?;
                    metadata
                }
                Some(metadata) => {
                    if metadata.version > METADATA_VERSION {
                        return Err(ScvError::VersionMismatch {
                            expected: METADATA_VERSION,
                            actual: metadata.version,
                        });
                    }
                    if metadata.version < METADATA_VERSION && !options.allow_old_version {
                        return Err(ScvError::VersionMismatch {
                            expected: METADATA_VERSION,
                            actual: metadata.version,
                        });
                    }
                    if metadata.block_size != options.block_size {
                        return Err(ScvError::BlockSizeMismatch {
                            expected: options.block_size,
                            actual: metadata.block_size,
                        });
                    }
                    if metadata.fsid != options.fsid {
                        return Err(ScvError::FsidMismatch {
                            expected: options.fsid,
                            actual: metadata.fsid,
                        });
                    }
                    metadata
                }
            }
        };
        txn.commit().map_err(store_err)?;
        Ok(metadata)
    }

    #[must_use]
    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// The generation ceiling applied to lookups and ranges.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    // ── Writing ─────────────────────────────────────────────────────────

    fn write_txn(&mut self) -> Result<&WriteTransaction> {
        if self.txn.is_none() {
            self.txn = Some(self.db.begin_write().map_err(store_err)?);
        }
        match self.txn.as_ref() {
            Some(txn) => Ok(txn),
            None => Err(ScvError::Closed),
        }
    }

    fn try_insert(&mut self, index_key: &IndexKey, value: &[u8]) -> Result<()> {
        let txn = self.write_txn()?;
        let mut table = txn.open_table(INDEX_TABLE).map_err(store_err)?;
        table
            .insert(index_key.as_slice(), value)
            .map_err(store_err)?;
        Ok(())
    }

    /// Roll back the pending insert batch.
    fn rollback(&mut self) {
        self.txn_inserts = 0;
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
        }
    }

    /// Insert one leaf item under `(owner, item.key(), generation)`.
    ///
    /// The stored value is the raw 25-byte item entry followed by the
    /// payload, so accessors can read the size without a side table. A
    /// failed insert rolls back the whole pending batch; a partial batch
    /// never becomes visible.
    pub fn insert_item(
        &mut self,
        owner: u64,
        generation: u64,
        item: Item<'_>,
        data: &[u8],
    ) -> Result<()> {
        if !self.writable {
            return Err(ScvError::ReadOnly);
        }
        let index_key = IndexKey::new(owner, item.key(), generation);
        let mut value = Vec::with_capacity(ITEM_LEN + data.len());
        value.extend_from_slice(item.raw());
        value.extend_from_slice(data);
        if let Err(error) = self.try_insert(&index_key, &value) {
            self.rollback();
            return Err(error);
        }
        self.txn_inserts += 1;
        if self.txn_inserts >= MAX_BATCHED_INSERTS {
            self.commit()?;
        }
        Ok(())
    }

    /// Flush the pending insert batch to disk.
    pub fn commit(&mut self) -> Result<()> {
        self.txn_inserts = 0;
        if let Some(txn) = self.txn.take() {
            txn.commit().map_err(store_err)?;
        }
        Ok(())
    }

    /// Commit pending writes and close the index.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }

    // ── Reading ─────────────────────────────────────────────────────────

    fn read_table(&self) -> Result<IndexTable> {
        let txn = self.db.begin_read().map_err(store_err)?;
        txn.open_table(INDEX_TABLE).map_err(store_err)
    }

    /// Find the item stored under `(owner, key)` whose generation best
    /// matches the ceiling: the largest generation at or below it, or the
    /// smallest available one when every stored generation lies above.
    pub fn find_item(&self, owner: u64, key: Key) -> Result<Option<IndexItem>> {
        let table = self.read_table()?;
        match find_raw(&table, owner, key, self.generation)? {
            Some((index_key, value)) => Ok(Some(IndexItem::from_entry(index_key, value)?)),
            None => Ok(None),
        }
    }

    pub fn find_inode_item(&self, owner: u64, inode: u64) -> Result<Option<IndexItem>> {
        self.find_item(owner, key_first(&[u64::from(INODE_ITEM_KEY), inode]))
    }

    /// The first file extent of an inode, i.e. the one at file offset zero.
    pub fn find_file_extent_item(&self, owner: u64, inode: u64) -> Result<Option<IndexItem>> {
        self.find_item(owner, key_first(&[u64::from(EXTENT_DATA_KEY), inode]))
    }

    /// Iterate items in `[first, last]` under `owner`, visiting each logical
    /// key once at the generation chosen by the ceiling.
    pub fn range(&self, owner: u64, first: Key, last: Key) -> Result<RangeIter> {
        let table = self.read_table()?;
        RangeIter::new(table, owner, first, last, self.generation)
    }

    /// Range over all items `(item_type, object_id, *)` under `owner`.
    pub fn range_all(&self, owner: u64, item_type: u8, object_id: u64) -> Result<RangeIter> {
        self.range(
            owner,
            key_first(&[u64::from(item_type), object_id]),
            key_last(&[u64::from(item_type), object_id]),
        )
    }

    /// Directory entries of `dir_id`, keyed by name hash.
    pub fn dir_items(&self, owner: u64, dir_id: u64) -> Result<RangeIter> {
        self.range_all(owner, DIR_ITEM_KEY, dir_id)
    }

    /// Directory entries of `dir_id`, keyed by insertion sequence.
    pub fn dir_index_items(&self, owner: u64, dir_id: u64) -> Result<RangeIter> {
        self.range_all(owner, DIR_INDEX_KEY, dir_id)
    }

    pub fn xattr_items(&self, owner: u64, object_id: u64) -> Result<RangeIter> {
        self.range_all(owner, XATTR_ITEM_KEY, object_id)
    }

    /// Parent-directory backlinks of an inode, each carrying its filename.
    pub fn inode_refs(&self, owner: u64, inode: u64) -> Result<RangeIter> {
        self.range_all(owner, INODE_REF_KEY, inode)
    }

    pub fn file_extent_items(&self, owner: u64, inode: u64) -> Result<RangeIter> {
        self.range_all(owner, EXTENT_DATA_KEY, inode)
    }

    /// All subvolume and snapshot roots. Excludes the FS tree root itself,
    /// which is not considered a subvolume.
    pub fn subvolumes(&self) -> Result<RangeIter> {
        self.range(
            ROOT_TREE_OBJECT_ID,
            key_first(&[u64::from(ROOT_ITEM_KEY), FIRST_FREE_OBJECT_ID]),
            key_last(&[u64::from(ROOT_ITEM_KEY), LAST_FREE_OBJECT_ID]),
        )
    }

    /// Root refs naming the subvolumes below a given root.
    pub fn root_refs(&self, object_id: u64) -> Result<RangeIter> {
        self.range_all(ROOT_TREE_OBJECT_ID, ROOT_REF_KEY, object_id)
    }

    /// Every chunk item, from the chunk tree.
    pub fn chunk_items(&self) -> Result<RangeIter> {
        self.range_all(
            scv_ondisk::CHUNK_TREE_OBJECT_ID,
            CHUNK_ITEM_KEY,
            FIRST_CHUNK_TREE_OBJECT_ID,
        )
    }

    /// Iterate every stored entry without generation filtering, in encoded
    /// key order. The metadata record is skipped.
    pub fn full_range(&self) -> Result<FullRangeIter> {
        let table = self.read_table()?;
        Ok(FullRangeIter {
            table,
            last: None,
            done: false,
        })
    }

    // ── Schema upgrade ──────────────────────────────────────────────────

    /// Rewrite an index created by the previous schema (generation-first
    /// keys) into the current layout, in place. The whole rewrite happens in
    /// one transaction, so a crash leaves either the old or the new index.
    pub fn upgrade_in_place(&mut self) -> Result<u64> {
        if !self.writable {
            return Err(ScvError::ReadOnly);
        }
        if self.metadata.version == METADATA_VERSION {
            return Ok(0);
        }
        if self.metadata.version > METADATA_VERSION {
            return Err(ScvError::VersionMismatch {
                expected: METADATA_VERSION,
                actual: self.metadata.version,
            });
        }
        self.commit()?;

        let mut rewritten = 0_u64;
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let old = txn.open_table(INDEX_TABLE).map_err(store_err)?;
            let mut staged = txn.open_table(UPGRADE_TABLE).map_err(store_err)?;
            for entry in old.range::<&[u8]>(..).map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                let old_key = IndexKey::from_slice(k.value())?;
                let (owner, key, generation) = decode_v1(
                    old_key
                        .as_slice()
                        .try_into()
                        .map_err(|_| ScvError::Format("index key width".to_owned()))?,
                );
                if owner == u64::MAX && key.item_type == u8::MAX {
                    continue; // old metadata sentinel, rewritten below
                }
                let new_key = IndexKey::new(owner, key, generation);
                staged
                    .insert(new_key.as_slice(), v.value())
                    .map_err(store_err)?;
                rewritten += 1;
            }
        }
        txn.delete_table(INDEX_TABLE).map_err(store_err)?;
        let metadata = IndexMetadata {
            version: METADATA_VERSION,
            ..self.metadata
        };
        {
            let mut fresh = txn.open_table(INDEX_TABLE).map_err(store_err)?;
            let staged = txn.open_table(UPGRADE_TABLE).map_err(store_err)?;
            for entry in staged.range::<&[u8]>(..).map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                fresh.insert(k.value(), v.value()).map_err(store_err)?;
            }
            fresh
                .insert(metadata_key().as_slice(), metadata.encode().as_slice())
                .map_err(store_err)?;
        }
        txn.delete_table(UPGRADE_TABLE).map_err(store_err)?;
        txn.commit().map_err(store_err)?;

        self.metadata = metadata;
        info!(rewritten, "index upgraded to v{METADATA_VERSION}");
        Ok(rewritten)
    }

    /// Number of stored entries, metadata record included.
    pub fn len(&self) -> Result<u64> {
        Ok(self.read_table()?.len().map_err(store_err)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= 1)
    }
}

impl Drop for Index {
    /// A dropped writer commits its pending batch: any prefix of inserts
    /// that reached the index is valid on its own.
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(error) = txn.commit() {
                warn!(%error, "failed to commit pending index transaction on drop");
            }
        }
    }
}

// ── Seek primitives ─────────────────────────────────────────────────────────

fn read_entry(
    entry: std::result::Result<
        (redb::AccessGuard<'_, &'static [u8]>, redb::AccessGuard<'_, &'static [u8]>),
        redb::StorageError,
    >,
) -> Result<(IndexKey, Vec<u8>)> {
    let (k, v) = entry.map_err(store_err)?;
    Ok((IndexKey::from_slice(k.value())?, v.value().to_vec()))
}

/// First entry with key ≥ `from`.
fn seek_ge(table: &IndexTable, from: &IndexKey) -> Result<Option<(IndexKey, Vec<u8>)>> {
    let mut range = table.range(from.as_slice()..).map_err(store_err)?;
    range.next().map(read_entry).transpose()
}

/// First entry with key strictly greater than `from`.
fn seek_gt(table: &IndexTable, from: &IndexKey) -> Result<Option<(IndexKey, Vec<u8>)>> {
    let bounds = (Bound::Excluded(from.as_slice()), Bound::Unbounded);
    let mut range = table.range::<&[u8]>(bounds).map_err(store_err)?;
    range.next().map(read_entry).transpose()
}

/// Last entry with key strictly below `before`.
fn seek_lt(table: &IndexTable, before: &IndexKey) -> Result<Option<(IndexKey, Vec<u8>)>> {
    let mut range = table.range(..before.as_slice()).map_err(store_err)?;
    range.next_back().map(read_entry).transpose()
}

/// Generation-aware point lookup: the largest stored generation at or below
/// the ceiling. Seeking to `(owner, key, ceiling)` hits either the version
/// written at the ceiling itself (returned as-is) or the smallest newer
/// one; in the latter case one step back yields the largest generation
/// below the ceiling. Only when every stored generation lies above the
/// ceiling does the newer seek hit get returned, as the documented
/// earliest-available fallback.
fn find_raw(
    table: &IndexTable,
    owner: u64,
    key: Key,
    generation: u64,
) -> Result<Option<(IndexKey, Vec<u8>)>> {
    let search = IndexKey::new(owner, key, generation);
    let above_ceiling = match seek_ge(table, &search)? {
        Some((found, value)) if found.logical_prefix() == search.logical_prefix() => {
            if found.generation() == generation {
                return Ok(Some((found, value)));
            }
            Some((found, value))
        }
        _ => None,
    };
    if let Some((found, value)) = seek_lt(table, &search)? {
        if found.logical_prefix() == search.logical_prefix() {
            return Ok(Some((found, value)));
        }
    }
    Ok(above_ceiling)
}

// ── Range iterators ─────────────────────────────────────────────────────────

/// Iterator over a key range, visiting each logical key once at the
/// generation selected by the ceiling.
pub struct RangeIter {
    table: IndexTable,
    generation: u64,
    end: IndexKey,
    current: Option<(IndexKey, Vec<u8>)>,
}

impl RangeIter {
    fn new(table: IndexTable, owner: u64, first: Key, last: Key, generation: u64) -> Result<Self> {
        let end = IndexKey::new(owner, last, generation);
        let start = IndexKey::new(owner, first, 0);
        let current = match seek_ge(&table, &start)? {
            Some((found, _)) => match find_raw(&table, found.owner(), found.key(), generation)? {
                Some((resolved, value)) if resolved <= end => Some((resolved, value)),
                _ => None,
            },
            None => None,
        };
        Ok(Self {
            table,
            generation,
            end,
            current,
        })
    }

    /// Advance past every generation of `from`'s logical key, then resolve
    /// the next logical key under the generation ceiling.
    fn advance(&self, from: &IndexKey) -> Result<Option<(IndexKey, Vec<u8>)>> {
        let probe = from.with_generation(u64::MAX);
        let Some((next_logical, _)) = seek_gt(&self.table, &probe)? else {
            return Ok(None);
        };
        match find_raw(
            &self.table,
            next_logical.owner(),
            next_logical.key(),
            self.generation,
        )? {
            Some((resolved, value)) if resolved <= self.end => Ok(Some((resolved, value))),
            _ => Ok(None),
        }
    }
}

impl Iterator for RangeIter {
    type Item = Result<IndexItem>;

    fn next(&mut self) -> Option<Self::Item> {
        let (index_key, value) = self.current.take()?;
        match self.advance(&index_key) {
            Ok(next) => self.current = next,
            Err(error) => return Some(Err(error)),
        }
        Some(IndexItem::from_entry(index_key, value))
    }
}

/// Iterator over every stored entry in encoded key order, all generations
/// included. Used by index dumps and the schema upgrade.
pub struct FullRangeIter {
    table: IndexTable,
    last: Option<IndexKey>,
    done: bool,
}

impl Iterator for FullRangeIter {
    type Item = Result<IndexItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match &self.last {
            None => seek_ge(&self.table, &IndexKey::new(0, key_first(&[]), 0)),
            Some(last) => seek_gt(&self.table, last),
        };
        match next {
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some((index_key, value))) => {
                self.last = Some(index_key);
                if index_key == metadata_key() {
                    self.done = true;
                    return None;
                }
                Some(IndexItem::from_entry(index_key, value))
            }
        }
    }
}

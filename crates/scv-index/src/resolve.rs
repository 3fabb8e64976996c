//! Path resolution and logical→physical address mapping on top of the index.

use crate::{Index, IndexItem};
use scv_error::Result;
use scv_ondisk::{DIR_ITEM_KEY, FIRST_FREE_OBJECT_ID, key_first, name_hash};
use tracing::trace;

/// The directory entry a path resolved to, together with the tree and
/// object id to continue from. After a subvolume crossing, `owner` is the
/// subvolume's tree and `object_id` is its first free object id.
#[derive(Debug)]
pub struct PathMatch {
    /// Tree holding the entry's target.
    pub owner: u64,
    /// Object id of the target (a directory to list, or a file's inode).
    pub object_id: u64,
    /// The matched directory entry.
    pub item: IndexItem,
}

impl Index {
    /// Resolve a posix-style path to its directory entry, starting from
    /// `owner` at the tree's first free object id.
    ///
    /// Each component is first looked up by name hash (the `DIR_ITEM` fast
    /// path); on a miss the directory's `DIR_INDEX` entries are scanned.
    /// Intermediate components must be directories; the final one may be
    /// anything. Entries whose location is a root item cross into the named
    /// subvolume.
    pub fn find_dir_item_for_path(&self, owner: u64, path: &str) -> Result<Option<PathMatch>> {
        let components: Vec<&str> = path
            .split('/')
            .filter(|comp| !comp.is_empty() && *comp != ".")
            .collect();
        if components.is_empty() {
            return Ok(None);
        }

        let mut owner = owner;
        let mut dir_id = FIRST_FREE_OBJECT_ID;
        let mut result = None;

        for (i, comp) in components.iter().enumerate() {
            let last = i == components.len() - 1;
            let mut matched: Option<IndexItem> = None;

            // Fast path: point lookup by name hash.
            let hash = u64::from(name_hash(comp.as_bytes()));
            if let Some(item) =
                self.find_item(owner, key_first(&[u64::from(DIR_ITEM_KEY), dir_id, hash]))?
            {
                let name_matches = item
                    .as_dir_item()
                    .is_some_and(|dir| dir.name_bytes() == comp.as_bytes());
                if name_matches {
                    matched = Some(item);
                }
            }

            // Slow path: scan the directory's index entries.
            if matched.is_none() {
                for entry in self.dir_index_items(owner, dir_id)? {
                    let item = entry?;
                    let hit = item.as_dir_item().is_some_and(|dir| {
                        dir.name_bytes() == comp.as_bytes() && (dir.is_dir() || last)
                    });
                    if hit {
                        matched = Some(item);
                        break;
                    }
                }
            }

            let Some(item) = matched else {
                trace!(owner, dir_id, component = comp, "path component not found");
                return Ok(None);
            };
            let Some((location, is_subvolume)) = item
                .as_dir_item()
                .map(|dir| (dir.location(), dir.is_subvolume()))
            else {
                return Ok(None);
            };

            if is_subvolume {
                owner = location.object_id;
                dir_id = FIRST_FREE_OBJECT_ID;
            } else {
                dir_id = location.object_id;
            }
            result = Some(PathMatch {
                owner,
                object_id: dir_id,
                item,
            });
        }

        Ok(result)
    }
}

// ── Logical → physical mapping ──────────────────────────────────────────────

/// One chunk's placement: a logical range start mapped to the first stripe's
/// device and physical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    pub logical: u64,
    pub length: u64,
    pub dev_id: u64,
    pub physical: u64,
}

/// Cached translation from logical extent addresses to device offsets,
/// built once from the recovered chunk items.
///
/// Only the first stripe of each chunk is used, which suffices for
/// single-device filesystems. Addresses past a chunk's length resolve
/// against that chunk unchecked.
#[derive(Debug, Default)]
pub struct ChunkMap {
    entries: Vec<ChunkMapping>,
}

impl ChunkMap {
    pub fn build(index: &Index) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in index.chunk_items()? {
            let item = entry?;
            let Some(chunk) = item.as_chunk() else {
                continue;
            };
            if chunk.num_stripes() == 0 {
                continue;
            }
            let stripe = chunk.stripe(0);
            entries.push(ChunkMapping {
                logical: item.key().offset,
                length: chunk.length(),
                dev_id: stripe.dev_id,
                physical: stripe.offset,
            });
        }
        // Key order already yields ascending logical starts; sort anyway
        // rather than relying on it.
        entries.sort_by_key(|entry| entry.logical);
        Ok(Self { entries })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a logical address to `(device id, physical offset)` using the
    /// greatest chunk whose logical start is at or below the address.
    #[must_use]
    pub fn physical(&self, logical: u64) -> Option<(u64, u64)> {
        let idx = self
            .entries
            .partition_point(|entry| entry.logical <= logical);
        let entry = self.entries[..idx].last()?;
        Some((entry.dev_id, entry.physical + (logical - entry.logical)))
    }
}

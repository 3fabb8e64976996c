//! Index store behavior: metadata handling, generation-aware lookups,
//! persistence across reopen, and the in-place schema upgrade.

use scv_error::ScvError;
use scv_index::{Index, IndexKey, IndexMetadata, IndexOptions, METADATA_VERSION};
use scv_ondisk::{
    DIR_ITEM_KEY, FS_TREE_OBJECT_ID, INODE_ITEM_KEY, ITEM_LEN, Item, Key, key_first, key_last,
};
use uuid::Uuid;

fn fsid() -> Uuid {
    Uuid::from_bytes([
        0xA7, 0xF3, 0x26, 0x75, 0xA3, 0x26, 0x04, 0xF9, 0x2C, 0xD1, 0xE4, 0x8B, 0x6F, 0x93, 0x98,
        0xE0,
    ])
}

fn options() -> IndexOptions {
    IndexOptions {
        block_size: 4096,
        fsid: fsid(),
        generation: u64::MAX,
        allow_old_version: false,
    }
}

/// A 25-byte item directory entry for `key` with the given payload size.
fn raw_item(key: Key, size: u32) -> Vec<u8> {
    let mut raw = Vec::with_capacity(ITEM_LEN);
    raw.extend_from_slice(&key.object_id.to_le_bytes());
    raw.push(key.item_type);
    raw.extend_from_slice(&key.offset.to_le_bytes());
    raw.extend_from_slice(&0_u32.to_le_bytes());
    raw.extend_from_slice(&size.to_le_bytes());
    raw
}

fn insert(index: &mut Index, owner: u64, generation: u64, key: Key, data: &[u8]) {
    let raw = raw_item(key, data.len() as u32);
    let item = Item::from_raw(&raw).expect("item entry");
    index
        .insert_item(owner, generation, item, data)
        .expect("insert");
}

#[test]
fn metadata_round_trips_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");

    let index = Index::open(&path, &options()).expect("create");
    assert_eq!(index.metadata().version, METADATA_VERSION);
    index.close().expect("close");

    let index = Index::open_read_only(&path).expect("reopen");
    let metadata = index.metadata();
    assert_eq!(metadata.block_size, 4096);
    assert_eq!(metadata.fsid, fsid());
    assert_eq!(metadata.generation, u64::MAX);
}

#[test]
fn reopen_rejects_mismatched_geometry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    Index::open(&path, &options()).expect("create").close().expect("close");

    let mut wrong_block = options();
    wrong_block.block_size = 16384;
    assert!(matches!(
        Index::open(&path, &wrong_block),
        Err(ScvError::BlockSizeMismatch { .. })
    ));

    let mut wrong_fsid = options();
    wrong_fsid.fsid = Uuid::from_bytes([9; 16]);
    assert!(matches!(
        Index::open(&path, &wrong_fsid),
        Err(ScvError::FsidMismatch { .. })
    ));
}

#[test]
fn open_read_only_requires_existing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(matches!(
        Index::open_read_only(dir.path().join("missing")),
        Err(ScvError::NotFound(_))
    ));
}

#[test]
fn generation_ceiling_selects_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    let mut index = Index::open(&path, &options()).expect("create");

    let key = key_first(&[u64::from(INODE_ITEM_KEY), 256]);
    insert(&mut index, FS_TREE_OBJECT_ID, 5, key, b"generation-five");
    insert(&mut index, FS_TREE_OBJECT_ID, 12, key, b"generation-twelve");
    index.commit().expect("commit");

    // Ceiling between the versions picks the older one.
    index.set_generation(10);
    let item = index
        .find_inode_item(FS_TREE_OBJECT_ID, 256)
        .expect("lookup")
        .expect("present");
    assert_eq!(item.generation(), 5);
    assert_eq!(item.data(), b"generation-five");

    // Ceiling at or above the newest picks the newest.
    for ceiling in [12, u64::MAX] {
        index.set_generation(ceiling);
        let item = index
            .find_inode_item(FS_TREE_OBJECT_ID, 256)
            .expect("lookup")
            .expect("present");
        assert_eq!(item.generation(), 12);
        assert_eq!(item.data(), b"generation-twelve");
    }

    // Ceiling below every stored generation falls back to the earliest.
    index.set_generation(3);
    let item = index
        .find_inode_item(FS_TREE_OBJECT_ID, 256)
        .expect("lookup")
        .expect("present");
    assert_eq!(item.generation(), 5);

    // A different owner holds nothing for this key.
    index.set_generation(u64::MAX);
    assert!(index
        .find_inode_item(FS_TREE_OBJECT_ID + 1, 256)
        .expect("lookup")
        .is_none());
}

#[test]
fn range_visits_each_logical_key_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    let mut index = Index::open(&path, &options()).expect("create");

    for hash in [100_u64, 200, 300] {
        let key = Key::new(256, DIR_ITEM_KEY, hash);
        insert(&mut index, FS_TREE_OBJECT_ID, 5, key, b"old");
        insert(&mut index, FS_TREE_OBJECT_ID, 9, key, b"new");
    }
    // An entry outside the directory must not leak into the range.
    insert(
        &mut index,
        FS_TREE_OBJECT_ID,
        5,
        Key::new(257, DIR_ITEM_KEY, 100),
        b"other-dir",
    );
    index.commit().expect("commit");

    let collected: Vec<_> = index
        .dir_items(FS_TREE_OBJECT_ID, 256)
        .expect("range")
        .collect::<Result<_, _>>()
        .expect("entries");
    assert_eq!(collected.len(), 3);
    for (entry, hash) in collected.iter().zip([100_u64, 200, 300]) {
        assert_eq!(entry.key().offset, hash);
        assert_eq!(entry.generation(), 9);
        assert_eq!(entry.data(), b"new");
    }

    // With a lower ceiling the same walk yields the older generation.
    index.set_generation(5);
    let collected: Vec<_> = index
        .dir_items(FS_TREE_OBJECT_ID, 256)
        .expect("range")
        .collect::<Result<_, _>>()
        .expect("entries");
    assert_eq!(collected.len(), 3);
    assert!(collected.iter().all(|entry| entry.generation() == 5));
}

#[test]
fn committed_inserts_survive_reopen_in_key_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    let mut index = Index::open(&path, &options()).expect("create");

    let keys = [
        (2_u64, Key::new(500, 84, 1), 4_u64),
        (1, Key::new(256, 1, 0), 7),
        (1, Key::new(256, 1, 0), 3),
        (5, Key::new(300, 108, 4096), 9),
    ];
    for &(owner, key, generation) in &keys {
        insert(&mut index, owner, generation, key, b"payload");
    }
    index.close().expect("close");

    let index = Index::open_read_only(&path).expect("reopen");
    let entries: Vec<_> = index
        .full_range()
        .expect("full range")
        .collect::<Result<_, _>>()
        .expect("entries");
    assert_eq!(entries.len(), keys.len());

    let mut expected: Vec<IndexKey> = keys
        .iter()
        .map(|&(owner, key, generation)| IndexKey::new(owner, key, generation))
        .collect();
    expected.sort();
    let actual: Vec<IndexKey> = entries
        .iter()
        .map(|entry| IndexKey::new(entry.owner(), entry.key(), entry.generation()))
        .collect();
    assert_eq!(actual, expected);
}

#[test]
fn insert_batches_auto_commit_every_ten_thousand() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    let mut index = Index::open(&path, &options()).expect("create");

    // 10_000 inserts fill exactly one batch, which commits on its own; the
    // five after it stay pending.
    for offset in 0..10_005_u64 {
        let key = Key::new(256, DIR_ITEM_KEY, offset);
        insert(&mut index, FS_TREE_OBJECT_ID, 1, key, b"x");
    }
    // Reads observe committed state: one batch plus the metadata record.
    assert_eq!(index.len().expect("len"), 10_001);

    index.commit().expect("commit");
    assert_eq!(index.len().expect("len"), 10_006);
}

#[test]
fn read_only_handle_rejects_inserts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    Index::open(&path, &options()).expect("create").close().expect("close");

    let mut index = Index::open_read_only(&path).expect("reopen");
    let raw = raw_item(Key::new(256, 1, 0), 0);
    let item = Item::from_raw(&raw).expect("item");
    assert!(matches!(
        index.insert_item(5, 1, item, b""),
        Err(ScvError::ReadOnly)
    ));
}

// ── Schema upgrade ──────────────────────────────────────────────────────────

const V1_VERSION: u64 = 20161109;

/// Encode a key the way the previous schema did: generation first.
fn v1_key(owner: u64, key: Key, generation: u64) -> [u8; 33] {
    let mut bytes = [0_u8; 33];
    bytes[0..8].copy_from_slice(&generation.to_be_bytes());
    bytes[8..16].copy_from_slice(&owner.to_be_bytes());
    bytes[16] = key.item_type;
    bytes[17..25].copy_from_slice(&key.object_id.to_be_bytes());
    bytes[25..33].copy_from_slice(&key.offset.to_be_bytes());
    bytes
}

/// Build an index file in the v1 layout directly through the store.
fn write_v1_index(path: &std::path::Path, items: &[(u64, Key, u64, &[u8])]) {
    const TABLE: redb::TableDefinition<&[u8], &[u8]> = redb::TableDefinition::new("index");
    let db = redb::Database::create(path).expect("create v1 db");
    let txn = db.begin_write().expect("txn");
    {
        let mut table = txn.open_table(TABLE).expect("table");
        for &(owner, key, generation, data) in items {
            let mut value = raw_item(key, data.len() as u32);
            value.extend_from_slice(data);
            table
                .insert(v1_key(owner, key, generation).as_slice(), value.as_slice())
                .expect("insert");
        }
        let metadata = IndexMetadata {
            version: V1_VERSION,
            block_size: 4096,
            fsid: fsid(),
            generation: u64::MAX,
        };
        table
            .insert(
                v1_key(u64::MAX, key_last(&[]), u64::MAX).as_slice(),
                metadata.encode().as_slice(),
            )
            .expect("metadata");
    }
    txn.commit().expect("commit");
}

#[test]
fn old_version_refused_without_allow_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    write_v1_index(&path, &[]);

    assert!(matches!(
        Index::open(&path, &options()),
        Err(ScvError::VersionMismatch {
            actual: V1_VERSION,
            ..
        })
    ));
    assert!(matches!(
        Index::open_read_only(&path),
        Err(ScvError::VersionMismatch { .. })
    ));
}

#[test]
fn upgrade_rewrites_v1_keys_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metadata");
    let key = key_first(&[u64::from(INODE_ITEM_KEY), 256]);
    write_v1_index(
        &path,
        &[
            (FS_TREE_OBJECT_ID, key, 5, b"five"),
            (FS_TREE_OBJECT_ID, key, 12, b"twelve"),
        ],
    );

    let mut open_options = options();
    open_options.allow_old_version = true;
    let mut index = Index::open(&path, &open_options).expect("open old");
    assert_eq!(index.metadata().version, V1_VERSION);
    assert_eq!(index.upgrade_in_place().expect("upgrade"), 2);
    assert_eq!(index.metadata().version, METADATA_VERSION);

    // Upgrading again is a no-op.
    assert_eq!(index.upgrade_in_place().expect("noop"), 0);

    index.set_generation(10);
    let item = index
        .find_inode_item(FS_TREE_OBJECT_ID, 256)
        .expect("lookup")
        .expect("present");
    assert_eq!(item.generation(), 5);
    assert_eq!(item.data(), b"five");
    index.close().expect("close");

    // The upgraded index now opens without the allow flag.
    let index = Index::open_read_only(&path).expect("reopen");
    assert_eq!(index.metadata().version, METADATA_VERSION);
}

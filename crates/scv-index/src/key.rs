//! On-disk index key encoding.
//!
//! Every index entry is keyed by a fixed-width 33-byte string encoded
//! big-endian, so that lexicographic comparison on the raw bytes matches the
//! logical `(owner, type, object_id, offset, generation)` order. Generation
//! comes last: all generations of one logical key are stored as neighbors,
//! which the generation-aware lookups rely on. The btrfs format itself is
//! little-endian; only the index key uses big-endian.

use scv_error::ScvError;
use scv_ondisk::Key;

/// Field offsets within an encoded index key.
const OWNER_OFFSET: usize = 0;
const TYPE_OFFSET: usize = OWNER_OFFSET + 8;
const OBJECT_ID_OFFSET: usize = TYPE_OFFSET + 1;
const KEY_OFFSET_OFFSET: usize = OBJECT_ID_OFFSET + 8;
/// Start of the generation field; everything before it identifies the
/// logical key.
pub const GENERATION_OFFSET: usize = KEY_OFFSET_OFFSET + 8;
/// Total encoded length.
pub const INDEX_KEY_LEN: usize = GENERATION_OFFSET + 8;

/// A fully encoded index key. Byte-wise comparison equals logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey([u8; INDEX_KEY_LEN]);

impl IndexKey {
    #[must_use]
    pub fn new(owner: u64, key: Key, generation: u64) -> Self {
        let mut bytes = [0_u8; INDEX_KEY_LEN];
        bytes[OWNER_OFFSET..TYPE_OFFSET].copy_from_slice(&owner.to_be_bytes());
        bytes[TYPE_OFFSET] = key.item_type;
        bytes[OBJECT_ID_OFFSET..KEY_OFFSET_OFFSET].copy_from_slice(&key.object_id.to_be_bytes());
        bytes[KEY_OFFSET_OFFSET..GENERATION_OFFSET].copy_from_slice(&key.offset.to_be_bytes());
        bytes[GENERATION_OFFSET..].copy_from_slice(&generation.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ScvError> {
        let array: [u8; INDEX_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ScvError::Format(format!("index key has length {}", bytes.len())))?;
        Ok(Self(array))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// The bytes identifying the logical key, excluding the generation.
    #[must_use]
    pub fn logical_prefix(&self) -> &[u8] {
        &self.0[..GENERATION_OFFSET]
    }

    #[must_use]
    pub fn with_generation(&self, generation: u64) -> Self {
        let mut bytes = self.0;
        bytes[GENERATION_OFFSET..].copy_from_slice(&generation.to_be_bytes());
        Self(bytes)
    }

    fn be_u64(&self, offset: usize) -> u64 {
        u64::from_be_bytes([
            self.0[offset],
            self.0[offset + 1],
            self.0[offset + 2],
            self.0[offset + 3],
            self.0[offset + 4],
            self.0[offset + 5],
            self.0[offset + 6],
            self.0[offset + 7],
        ])
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        self.be_u64(OWNER_OFFSET)
    }

    #[must_use]
    pub fn key(&self) -> Key {
        Key {
            object_id: self.be_u64(OBJECT_ID_OFFSET),
            item_type: self.0[TYPE_OFFSET],
            offset: self.be_u64(KEY_OFFSET_OFFSET),
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.be_u64(GENERATION_OFFSET)
    }
}

/// Encode a key in the previous index layout, which sorted the generation
/// first: `[generation | owner | type | object_id | offset]`. Only needed to
/// locate old records during an upgrade.
#[must_use]
pub fn encode_v1(owner: u64, key: Key, generation: u64) -> [u8; INDEX_KEY_LEN] {
    let mut bytes = [0_u8; INDEX_KEY_LEN];
    bytes[0..8].copy_from_slice(&generation.to_be_bytes());
    bytes[8..16].copy_from_slice(&owner.to_be_bytes());
    bytes[16] = key.item_type;
    bytes[17..25].copy_from_slice(&key.object_id.to_be_bytes());
    bytes[25..33].copy_from_slice(&key.offset.to_be_bytes());
    bytes
}

/// Decode a key written by the previous index layout, which sorted the
/// generation first: `[generation | owner | type | object_id | offset]`.
#[must_use]
pub fn decode_v1(bytes: &[u8; INDEX_KEY_LEN]) -> (u64, Key, u64) {
    let be = |offset: usize| {
        u64::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ])
    };
    let generation = be(0);
    let owner = be(8);
    let key = Key {
        item_type: bytes[16],
        object_id: be(17),
        offset: be(25),
    };
    (owner, key, generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use scv_ondisk::key_last;

    #[test]
    fn encode_decode_round_trip() {
        let key = Key::new(256, 84, 0xDEAD_BEEF);
        let ik = IndexKey::new(5, key, 42);
        assert_eq!(ik.owner(), 5);
        assert_eq!(ik.key(), key);
        assert_eq!(ik.generation(), 42);
        assert_eq!(ik.as_slice().len(), INDEX_KEY_LEN);
    }

    #[test]
    fn field_layout_is_big_endian() {
        let ik = IndexKey::new(1, Key::new(2, 3, 4), 5);
        let b = ik.as_slice();
        assert_eq!(&b[0..8], &1_u64.to_be_bytes());
        assert_eq!(b[8], 3);
        assert_eq!(&b[9..17], &2_u64.to_be_bytes());
        assert_eq!(&b[17..25], &4_u64.to_be_bytes());
        assert_eq!(&b[25..33], &5_u64.to_be_bytes());
    }

    #[test]
    fn metadata_sentinel_sorts_last() {
        let sentinel = IndexKey::new(u64::MAX, key_last(&[]), u64::MAX);
        let ordinary = IndexKey::new(u64::MAX - 1, key_last(&[]), u64::MAX);
        assert!(sentinel > ordinary);
        assert!(sentinel > IndexKey::new(5, Key::new(u64::MAX, 255, u64::MAX), u64::MAX));
    }

    #[test]
    fn from_slice_validates_length() {
        assert!(IndexKey::from_slice(&[0_u8; 32]).is_err());
        assert!(IndexKey::from_slice(&[0_u8; 34]).is_err());
        assert!(IndexKey::from_slice(&[0_u8; 33]).is_ok());
    }

    #[test]
    fn v1_encode_decode_round_trip() {
        let key = Key::new(256, 84, 99);
        let bytes = encode_v1(5, key, 7);
        let (owner, decoded, generation) = decode_v1(&bytes);
        assert_eq!(owner, 5);
        assert_eq!(decoded, key);
        assert_eq!(generation, 7);
    }

    #[test]
    fn v1_decode_reads_generation_first_layout() {
        let mut bytes = [0_u8; INDEX_KEY_LEN];
        bytes[0..8].copy_from_slice(&7_u64.to_be_bytes()); // generation
        bytes[8..16].copy_from_slice(&5_u64.to_be_bytes()); // owner
        bytes[16] = 84;
        bytes[17..25].copy_from_slice(&256_u64.to_be_bytes());
        bytes[25..33].copy_from_slice(&99_u64.to_be_bytes());
        let (owner, key, generation) = decode_v1(&bytes);
        assert_eq!(owner, 5);
        assert_eq!(key, Key::new(256, 84, 99));
        assert_eq!(generation, 7);
    }

    proptest! {
        #[test]
        fn round_trip_any_tuple(owner in any::<u64>(), object_id in any::<u64>(), item_type in any::<u8>(), offset in any::<u64>(), generation in any::<u64>()) {
            let key = Key { object_id, item_type, offset };
            let ik = IndexKey::new(owner, key, generation);
            prop_assert_eq!(ik.owner(), owner);
            prop_assert_eq!(ik.key(), key);
            prop_assert_eq!(ik.generation(), generation);
        }

        #[test]
        fn byte_order_matches_logical_order(
            a in (any::<u64>(), any::<u64>(), any::<u8>(), any::<u64>(), any::<u64>()),
            b in (any::<u64>(), any::<u64>(), any::<u8>(), any::<u64>(), any::<u64>()),
        ) {
            let ka = IndexKey::new(a.0, Key { object_id: a.1, item_type: a.2, offset: a.3 }, a.4);
            let kb = IndexKey::new(b.0, Key { object_id: b.1, item_type: b.2, offset: b.3 }, b.4);
            let logical_a = (a.0, Key { object_id: a.1, item_type: a.2, offset: a.3 }, a.4);
            let logical_b = (b.0, Key { object_id: b.1, item_type: b.2, offset: b.3 }, b.4);
            prop_assert_eq!(ka.as_slice().cmp(kb.as_slice()), logical_a.cmp(&logical_b));
        }
    }
}

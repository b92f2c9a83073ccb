//! Binary key encoding for journal storage.
//!
//! Every record in the store is addressed by a fixed-width 16-byte key:
//!
//! ```text
//! | namespace_id (i32 BE) | sequence_nr (i64 BE) | kind (i32 BE) |
//! ```
//!
//! Big-endian fixed-width encoding makes byte-lexicographic key order equal
//! tuple order `(namespace_id, sequence_nr, kind)`, so a forward range scan
//! walks one namespace in sequence order.
//!
//! A single keyspace carries several logical record kinds:
//!
//! - `(nid, seq, 0)` with `seq >= 1`: an event record
//! - `(nid, 0, 0)`: the namespace's counter (highest written sequence)
//! - `(nid, seq, 1)`: a tombstone marking the event at `seq` as deleted
//! - `(1, 0, id)`: a name-mapping entry; namespace id `1` is reserved for
//!   the mapping table itself, and the mapped id lives in the `kind` slot

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::model::{NamespaceId, SequenceNr};

/// Encoded key width in bytes.
pub const KEY_LEN: usize = 16;

/// Namespace id reserved for the name-mapping table.
pub const MAPPING_NAMESPACE_ID: NamespaceId = 1;

/// First id handed out to streams and tags; everything below is reserved.
pub const ID_OFFSET: NamespaceId = 10;

const DATA_KIND: i32 = 0;
const TOMBSTONE_KIND: i32 = 1;

/// A decoded storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub namespace_id: NamespaceId,
    pub sequence_nr: SequenceNr,
    pub kind: i32,
}

impl Key {
    /// Key of the event record at `sequence_nr` in a namespace.
    pub fn event(namespace_id: NamespaceId, sequence_nr: SequenceNr) -> Self {
        Self {
            namespace_id,
            sequence_nr,
            kind: DATA_KIND,
        }
    }

    /// Key of a namespace's counter record.
    pub fn counter(namespace_id: NamespaceId) -> Self {
        Self::event(namespace_id, 0)
    }

    /// Key of the tombstone for the event at `sequence_nr`.
    pub fn tombstone(namespace_id: NamespaceId, sequence_nr: SequenceNr) -> Self {
        Self {
            namespace_id,
            sequence_nr,
            kind: TOMBSTONE_KIND,
        }
    }

    /// Key of the mapping entry assigning numeric `id` to some name.
    pub fn mapping(id: NamespaceId) -> Self {
        Self {
            namespace_id: MAPPING_NAMESPACE_ID,
            sequence_nr: 0,
            kind: id,
        }
    }

    /// True if this key is a name-mapping entry.
    pub fn is_mapping(&self) -> bool {
        self.namespace_id == MAPPING_NAMESPACE_ID
    }

    /// True if this key marks a deleted event.
    pub fn is_tombstone(&self) -> bool {
        self.kind == TOMBSTONE_KIND
    }

    /// Serializes the key to its 16-byte storage form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(KEY_LEN);
        buf.put_i32(self.namespace_id);
        buf.put_i64(self.sequence_nr);
        buf.put_i32(self.kind);
        buf.freeze()
    }

    /// Decodes a key from its storage form.
    ///
    /// A length other than 16 bytes means the keyspace is corrupt; this is
    /// surfaced as [`Error::CorruptKey`] and never retried.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != KEY_LEN {
            return Err(Error::CorruptKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                data.len()
            )));
        }
        let namespace_id = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let sequence_nr = i64::from_be_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let kind = i32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        Ok(Self {
            namespace_id,
            sequence_nr,
            kind,
        })
    }
}

/// Serializes a counter value (highest written sequence number).
pub fn encode_counter(value: SequenceNr) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64(value);
    buf.freeze()
}

/// Decodes a counter value.
pub fn decode_counter(data: &[u8]) -> Result<SequenceNr> {
    if data.len() != 8 {
        return Err(Error::CorruptKey(format!(
            "counter value: expected 8 bytes, got {}",
            data.len()
        )));
    }
    Ok(i64::from_be_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_key() {
        // given
        let key = Key::event(42, 12345);

        // when
        let decoded = Key::decode(&key.encode()).unwrap();

        // then
        assert_eq!(decoded, key);
    }

    #[test]
    fn should_encode_key_as_16_bytes() {
        // given
        let key = Key::event(1, 2);

        // when
        let encoded = key.encode();

        // then
        assert_eq!(encoded.len(), KEY_LEN);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 1]);
        assert_eq!(&encoded[4..12], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&encoded[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn should_reject_wrong_length() {
        // given
        let data = [0u8; 15];

        // when
        let result = Key::decode(&data);

        // then
        assert!(matches!(result, Err(Error::CorruptKey(_))));
    }

    #[test]
    fn should_order_data_key_before_its_tombstone() {
        // given
        let data = Key::event(5, 7).encode();
        let tombstone = Key::tombstone(5, 7).encode();

        // when/then
        assert!(data < tombstone);
    }

    #[test]
    fn should_order_counter_before_first_event() {
        // given
        let counter = Key::counter(5).encode();
        let first_event = Key::event(5, 1).encode();

        // when/then
        assert!(counter < first_event);
    }

    #[test]
    fn should_identify_mapping_and_tombstone_keys() {
        // given/when/then
        assert!(Key::mapping(10).is_mapping());
        assert!(!Key::event(10, 1).is_mapping());
        assert!(Key::tombstone(10, 1).is_tombstone());
        assert!(!Key::event(10, 1).is_tombstone());
    }

    #[test]
    fn should_round_trip_counter_value() {
        // given/when/then
        assert_eq!(decode_counter(&encode_counter(0)).unwrap(), 0);
        assert_eq!(decode_counter(&encode_counter(i64::MAX)).unwrap(), i64::MAX);
    }

    #[test]
    fn should_reject_short_counter_value() {
        // given
        let data = [0u8; 4];

        // when
        let result = decode_counter(&data);

        // then
        assert!(matches!(result, Err(Error::CorruptKey(_))));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn should_round_trip_any_key(nid in 1i32..i32::MAX, seq in 0i64..i64::MAX, kind in 0i32..2) {
                let key = Key { namespace_id: nid, sequence_nr: seq, kind };
                prop_assert_eq!(Key::decode(&key.encode()).unwrap(), key);
            }

            #[test]
            fn should_preserve_tuple_ordering(
                a_nid in 1i32..1000, a_seq in 0i64..1_000_000, a_kind in 0i32..2,
                b_nid in 1i32..1000, b_seq in 0i64..1_000_000, b_kind in 0i32..2,
            ) {
                let a = Key { namespace_id: a_nid, sequence_nr: a_seq, kind: a_kind };
                let b = Key { namespace_id: b_nid, sequence_nr: b_seq, kind: b_kind };

                let tuple_order = (a_nid, a_seq, a_kind).cmp(&(b_nid, b_seq, b_kind));
                let byte_order = a.encode().cmp(&b.encode());

                prop_assert_eq!(
                    tuple_order,
                    byte_order,
                    "ordering mismatch: a={:?}, b={:?}",
                    a, b
                );
            }
        }
    }
}

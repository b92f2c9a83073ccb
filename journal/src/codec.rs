//! Event record serialization.
//!
//! The journal treats serialized records as opaque byte strings: whatever the
//! codec produces is stored verbatim at the event's key (and copied verbatim
//! into tag index entries) and handed back to the codec on replay. Embedders
//! with their own wire format plug in an [`EventCodec`] implementation.
//!
//! The default [`BinaryEventCodec`] uses a compact length-prefixed layout:
//!
//! ```text
//! | version (u8) | name_len (u16 BE) | name | writer_len (u16 BE) | writer
//! | sequence_nr (i64 BE) | payload... |
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::model::EventRecord;

/// Serialization codec for [`EventRecord`]s.
pub trait EventCodec: Send + Sync {
    /// Serializes a record to an opaque byte string.
    fn encode(&self, record: &EventRecord) -> Result<Bytes>;

    /// Deserializes a record from its stored form.
    fn decode(&self, data: &[u8]) -> Result<EventRecord>;
}

const CODEC_VERSION: u8 = 1;

/// Default binary codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryEventCodec;

impl BinaryEventCodec {
    fn put_str(buf: &mut BytesMut, value: &str, what: &str) -> Result<()> {
        let len = u16::try_from(value.len())
            .map_err(|_| Error::Encoding(format!("{} exceeds {} bytes", what, u16::MAX)))?;
        buf.put_u16(len);
        buf.put_slice(value.as_bytes());
        Ok(())
    }

    fn take_str<'a>(data: &mut &'a [u8], what: &str) -> Result<&'a str> {
        if data.len() < 2 {
            return Err(Error::Encoding(format!("truncated {} length", what)));
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        *data = &data[2..];
        if data.len() < len {
            return Err(Error::Encoding(format!("truncated {}", what)));
        }
        let (raw, rest) = data.split_at(len);
        *data = rest;
        std::str::from_utf8(raw).map_err(|_| Error::Encoding(format!("{} is not UTF-8", what)))
    }
}

impl EventCodec for BinaryEventCodec {
    fn encode(&self, record: &EventRecord) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            1 + 2 + record.stream_name.len() + 2 + record.writer.len() + 8 + record.payload.len(),
        );
        buf.put_u8(CODEC_VERSION);
        Self::put_str(&mut buf, &record.stream_name, "stream name")?;
        Self::put_str(&mut buf, &record.writer, "writer id")?;
        buf.put_i64(record.sequence_nr);
        buf.put_slice(&record.payload);
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<EventRecord> {
        let mut data = data;
        if data.is_empty() {
            return Err(Error::Encoding("empty record".to_string()));
        }
        let version = data[0];
        if version != CODEC_VERSION {
            return Err(Error::Encoding(format!(
                "unknown record version: {}",
                version
            )));
        }
        data = &data[1..];

        let stream_name = Self::take_str(&mut data, "stream name")?.to_string();
        let writer = Self::take_str(&mut data, "writer id")?.to_string();
        if data.len() < 8 {
            return Err(Error::Encoding("truncated sequence number".to_string()));
        }
        let sequence_nr = i64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);
        let payload = Bytes::copy_from_slice(&data[8..]);

        Ok(EventRecord {
            stream_name,
            sequence_nr,
            writer,
            payload,
        })
    }
}

//! Wire codec for tuple batches and completion signals
//!
//! A payload is a count followed by entries. Every entry starts with a marker
//! byte that tells a data tuple apart from each Fin variant, so control
//! signals never depend on a sentinel value inside a column:
//!
//! ```text
//! payload := u32 count, entry*
//! entry   := 0x00 column*                 data tuple
//!          | 0x01                         Fin
//!          | 0x02 u32 n, profile*         Fin with profiles
//!          | 0x03 str origin, str message Fin with exception
//! column  := 0x00 | 0x01 value            null / present
//! ```
//!
//! All integers are big-endian. A Fin, if present, is the last entry.

use crate::error::{DistributedError, Result};
use crate::fin::{Failure, Fin, OperatorProfile};
use crate::types::OperatorId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use query_core::{DataType, Schema, Tuple, Value};

const MARKER_DATA: u8 = 0x00;
const MARKER_FIN: u8 = 0x01;
const MARKER_FIN_PROFILES: u8 = 0x02;
const MARKER_FIN_EXCEPTION: u8 = 0x03;

const COLUMN_NULL: u8 = 0x00;
const COLUMN_PRESENT: u8 = 0x01;

// operator id + kind length + three timestamps/counters
const MIN_PROFILE_LEN: usize = 16 + 4 + 8 * 3;

/// One entry of a channel: a data tuple or the terminating Fin
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(Tuple),
    Fin(Fin),
}

impl Message {
    pub fn is_fin(&self) -> bool {
        matches!(self, Message::Fin(_))
    }
}

/// Schema-bound encoder/decoder. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct Codec {
    schema: Schema,
}

impl Codec {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Encode a heterogeneous batch. A Fin is only allowed as the last entry.
    pub fn encode(&self, messages: &[Message]) -> Result<Bytes> {
        if let Some(pos) = messages.iter().position(Message::is_fin) {
            if pos + 1 != messages.len() {
                return Err(DistributedError::Codec(format!(
                    "Fin at position {} is followed by {} more entries",
                    pos,
                    messages.len() - pos - 1
                )));
            }
        }

        let mut buf = BytesMut::with_capacity(64 * messages.len().max(1));
        buf.put_u32(entry_count(messages.len())?);
        for message in messages {
            match message {
                Message::Data(tuple) => self.put_tuple(&mut buf, tuple)?,
                Message::Fin(fin) => put_fin(&mut buf, fin)?,
            }
        }
        Ok(buf.freeze())
    }

    /// Encode data tuples optionally followed by a trailing Fin
    pub fn encode_batch(&self, tuples: &[Tuple], fin: Option<&Fin>) -> Result<Bytes> {
        let count = tuples.len() + usize::from(fin.is_some());
        let mut buf = BytesMut::with_capacity(64 * count.max(1));
        buf.put_u32(entry_count(count)?);
        for tuple in tuples {
            self.put_tuple(&mut buf, tuple)?;
        }
        if let Some(fin) = fin {
            put_fin(&mut buf, fin)?;
        }
        Ok(buf.freeze())
    }

    /// Decode a payload. Fails without producing partial tuples.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Message>> {
        let mut buf = bytes;
        ensure(&buf, 4, "entry count")?;
        let count = buf.get_u32() as usize;
        if count > buf.remaining() {
            return Err(DistributedError::Codec(format!(
                "Entry count {} exceeds payload size {}",
                count,
                buf.remaining()
            )));
        }

        let mut messages = Vec::with_capacity(count);
        for idx in 0..count {
            if matches!(messages.last(), Some(Message::Fin(_))) {
                return Err(DistributedError::Codec(format!(
                    "Entry {} follows the terminating Fin",
                    idx
                )));
            }
            ensure(&buf, 1, "entry marker")?;
            let message = match buf.get_u8() {
                MARKER_DATA => Message::Data(self.get_tuple(&mut buf)?),
                MARKER_FIN => Message::Fin(Fin::Plain),
                MARKER_FIN_PROFILES => Message::Fin(Fin::WithProfiles(get_profiles(&mut buf)?)),
                MARKER_FIN_EXCEPTION => {
                    let origin = get_string(&mut buf)?;
                    let message = get_string(&mut buf)?;
                    Message::Fin(Fin::WithException(Failure { origin, message }))
                }
                other => {
                    return Err(DistributedError::Codec(format!(
                        "Unknown entry marker 0x{:02x}",
                        other
                    )))
                }
            };
            messages.push(message);
        }

        if buf.has_remaining() {
            return Err(DistributedError::Codec(format!(
                "{} trailing bytes after {} entries",
                buf.remaining(),
                count
            )));
        }
        Ok(messages)
    }

    fn put_tuple(&self, buf: &mut BytesMut, tuple: &Tuple) -> Result<()> {
        self.schema
            .validate(tuple)
            .map_err(|e| DistributedError::Codec(e.to_string()))?;

        buf.put_u8(MARKER_DATA);
        for value in tuple {
            if value.is_null() {
                buf.put_u8(COLUMN_NULL);
                continue;
            }
            buf.put_u8(COLUMN_PRESENT);
            match value {
                Value::Null => {}
                Value::Boolean(v) => buf.put_u8(u8::from(*v)),
                Value::Int8(v) => buf.put_i8(*v),
                Value::Int16(v) => buf.put_i16(*v),
                Value::Int32(v) => buf.put_i32(*v),
                Value::Int64(v) => buf.put_i64(*v),
                Value::Float32(v) => buf.put_f32(*v),
                Value::Float64(v) => buf.put_f64(*v),
                Value::Decimal128(v) => buf.put_i128(*v),
                Value::Utf8(v) => put_bytes(buf, v.as_bytes())?,
                Value::Binary(v) => put_bytes(buf, v)?,
                Value::Date32(v) => buf.put_i32(*v),
                Value::Timestamp(v) => buf.put_i64(*v),
            }
        }
        Ok(())
    }

    fn get_tuple(&self, buf: &mut &[u8]) -> Result<Tuple> {
        let mut tuple = Vec::with_capacity(self.schema.len());
        for field in self.schema.fields() {
            ensure(buf, 1, "null flag")?;
            match buf.get_u8() {
                COLUMN_NULL => {
                    if !field.nullable() {
                        return Err(DistributedError::Codec(format!(
                            "Null in non-nullable column {}",
                            field.name()
                        )));
                    }
                    tuple.push(Value::Null);
                }
                COLUMN_PRESENT => tuple.push(get_value(buf, field.data_type())?),
                other => {
                    return Err(DistributedError::Codec(format!(
                        "Invalid null flag 0x{:02x} in column {}",
                        other,
                        field.name()
                    )))
                }
            }
        }
        Ok(tuple)
    }
}

fn entry_count(count: usize) -> Result<u32> {
    u32::try_from(count)
        .map_err(|_| DistributedError::Codec(format!("Batch of {} entries is too large", count)))
}

fn ensure(buf: &&[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(DistributedError::Codec(format!(
            "Truncated payload reading {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| DistributedError::Codec(format!("Value of {} bytes is too large", bytes.len())))?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    ensure(buf, 4, "length prefix")?;
    let len = buf.get_u32() as usize;
    ensure(buf, len, "variable-length value")?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    String::from_utf8(get_bytes(buf)?)
        .map_err(|e| DistributedError::Codec(format!("Invalid UTF-8: {}", e)))
}

fn get_value(buf: &mut &[u8], data_type: &DataType) -> Result<Value> {
    let value = match data_type {
        DataType::Boolean => {
            ensure(buf, 1, "boolean")?;
            match buf.get_u8() {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(DistributedError::Codec(format!(
                        "Invalid boolean byte 0x{:02x}",
                        other
                    )))
                }
            }
        }
        DataType::Int8 => {
            ensure(buf, 1, "int8")?;
            Value::Int8(buf.get_i8())
        }
        DataType::Int16 => {
            ensure(buf, 2, "int16")?;
            Value::Int16(buf.get_i16())
        }
        DataType::Int32 => {
            ensure(buf, 4, "int32")?;
            Value::Int32(buf.get_i32())
        }
        DataType::Int64 => {
            ensure(buf, 8, "int64")?;
            Value::Int64(buf.get_i64())
        }
        DataType::Float32 => {
            ensure(buf, 4, "float32")?;
            Value::Float32(buf.get_f32())
        }
        DataType::Float64 => {
            ensure(buf, 8, "float64")?;
            Value::Float64(buf.get_f64())
        }
        DataType::Decimal128 { .. } => {
            ensure(buf, 16, "decimal128")?;
            Value::Decimal128(buf.get_i128())
        }
        DataType::Utf8 => Value::Utf8(get_string(buf)?),
        DataType::Binary => Value::Binary(get_bytes(buf)?),
        DataType::Date32 => {
            ensure(buf, 4, "date32")?;
            Value::Date32(buf.get_i32())
        }
        DataType::Timestamp => {
            ensure(buf, 8, "timestamp")?;
            Value::Timestamp(buf.get_i64())
        }
    };
    Ok(value)
}

fn put_fin(buf: &mut BytesMut, fin: &Fin) -> Result<()> {
    match fin {
        Fin::Plain => buf.put_u8(MARKER_FIN),
        Fin::WithProfiles(profiles) => {
            buf.put_u8(MARKER_FIN_PROFILES);
            buf.put_u32(entry_count(profiles.len())?);
            for profile in profiles {
                buf.put_slice(profile.operator_id.as_bytes());
                put_bytes(buf, profile.kind.as_bytes())?;
                buf.put_u64(profile.start_ts);
                buf.put_u64(profile.end_ts);
                buf.put_u64(profile.processed);
            }
        }
        Fin::WithException(failure) => {
            buf.put_u8(MARKER_FIN_EXCEPTION);
            put_bytes(buf, failure.origin.as_bytes())?;
            put_bytes(buf, failure.message.as_bytes())?;
        }
    }
    Ok(())
}

fn get_profiles(buf: &mut &[u8]) -> Result<Vec<OperatorProfile>> {
    ensure(buf, 4, "profile count")?;
    let count = buf.get_u32() as usize;
    if count.saturating_mul(MIN_PROFILE_LEN) > buf.remaining() {
        return Err(DistributedError::Codec(format!(
            "Profile count {} exceeds payload size",
            count
        )));
    }

    let mut profiles = Vec::with_capacity(count);
    for _ in 0..count {
        ensure(buf, 16, "operator id")?;
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let kind = get_string(buf)?;
        ensure(buf, 24, "profile counters")?;
        profiles.push(OperatorProfile {
            operator_id: OperatorId::from_bytes(id),
            kind,
            start_ts: buf.get_u64(),
            end_ts: buf.get_u64(),
            processed: buf.get_u64(),
        });
    }
    Ok(profiles)
}

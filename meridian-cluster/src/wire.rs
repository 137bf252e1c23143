//! Self-describing binary encoding for the wire protocol.
//!
//! Primitives: LEB128 var-ints (vint/vlong), zig-zag signed longs,
//! length-prefixed UTF-8 strings and byte blobs. Generic values are tagged:
//!
//! ```text
//! 0 null | 1 bool | 2 long (zig-zag vlong) | 3 double (8B BE)
//! 4 string | 5 bytes | 6 list | 7 map
//! ```
//!
//! Typed message bodies use bincode on top of the frame layer; this encoding
//! carries the frame header strings and any generic values embedded in
//! messages (settings maps, document sources in mixed payloads).

use crate::error::{ClusterError, Result};
use bytes::{Buf, BufMut};
use serde_json::{Map, Number, Value};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;

fn underflow() -> ClusterError {
    ClusterError::Serialization("unexpected end of payload".to_string())
}

pub fn write_vlong(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn read_vlong(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(underflow());
        }
        let byte = buf.get_u8();
        if shift >= 64 {
            return Err(ClusterError::Serialization("vlong overflow".to_string()));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn write_vint(buf: &mut impl BufMut, value: u32) {
    write_vlong(buf, value as u64);
}

pub fn read_vint(buf: &mut impl Buf) -> Result<u32> {
    let value = read_vlong(buf)?;
    u32::try_from(value).map_err(|_| ClusterError::Serialization("vint overflow".to_string()))
}

/// Zig-zag signed encoding: small magnitudes stay small either side of zero.
pub fn write_zlong(buf: &mut impl BufMut, value: i64) {
    write_vlong(buf, (value.wrapping_shl(1) ^ (value >> 63)) as u64);
}

pub fn read_zlong(buf: &mut impl Buf) -> Result<i64> {
    let encoded = read_vlong(buf)?;
    Ok(((encoded >> 1) as i64) ^ -((encoded & 1) as i64))
}

pub fn write_string(buf: &mut impl BufMut, value: &str) {
    write_vint(buf, value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn read_string(buf: &mut impl Buf) -> Result<String> {
    let len = read_vint(buf)? as usize;
    if buf.remaining() < len {
        return Err(underflow());
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map_err(|_| ClusterError::Serialization("invalid utf-8 in string".to_string()))
}

pub fn write_byte_slice(buf: &mut impl BufMut, value: &[u8]) {
    write_vint(buf, value.len() as u32);
    buf.put_slice(value);
}

pub fn read_byte_slice(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = read_vint(buf)? as usize;
    if buf.remaining() < len {
        return Err(underflow());
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Write a generic value with its type tag.
pub fn write_value(buf: &mut impl BufMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                buf.put_u8(TAG_LONG);
                write_zlong(buf, v);
            } else {
                // u64 beyond i64::MAX and true floats both travel as double.
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64(n.as_f64().unwrap_or(0.0));
            }
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            write_string(buf, s);
        }
        Value::Array(items) => {
            buf.put_u8(TAG_LIST);
            write_vint(buf, items.len() as u32);
            for item in items {
                write_value(buf, item);
            }
        }
        Value::Object(map) => {
            buf.put_u8(TAG_MAP);
            write_vint(buf, map.len() as u32);
            for (key, item) in map {
                write_string(buf, key);
                write_value(buf, item);
            }
        }
    }
}

pub fn read_value(buf: &mut impl Buf) -> Result<Value> {
    if !buf.has_remaining() {
        return Err(underflow());
    }
    match buf.get_u8() {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => {
            if !buf.has_remaining() {
                return Err(underflow());
            }
            Ok(Value::Bool(buf.get_u8() != 0))
        }
        TAG_LONG => Ok(Value::Number(read_zlong(buf)?.into())),
        TAG_DOUBLE => {
            if buf.remaining() < 8 {
                return Err(underflow());
            }
            let v = buf.get_f64();
            Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
        }
        TAG_STRING => Ok(Value::String(read_string(buf)?)),
        TAG_BYTES => {
            // Byte blobs surface as a list of numbers when decoded
            // generically; typed readers use `read_byte_slice` directly.
            let bytes = read_byte_slice(buf)?;
            Ok(Value::Array(
                bytes.into_iter().map(|b| Value::Number(b.into())).collect(),
            ))
        }
        TAG_LIST => {
            let len = read_vint(buf)? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(read_value(buf)?);
            }
            Ok(Value::Array(items))
        }
        TAG_MAP => {
            let len = read_vint(buf)? as usize;
            let mut map = Map::with_capacity(len.min(1024));
            for _ in 0..len {
                let key = read_string(buf)?;
                map.insert(key, read_value(buf)?);
            }
            Ok(Value::Object(map))
        }
        tag => Err(ClusterError::Serialization(format!(
            "unknown value tag [{}]",
            tag
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;
    use serde_json::json;

    fn roundtrip_value(value: &Value) -> Value {
        let mut buf = BytesMut::new();
        write_value(&mut buf, value);
        let mut read = buf.freeze();
        read_value(&mut read).unwrap()
    }

    #[test]
    fn test_vlong_boundaries() {
        for value in [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            write_vlong(&mut buf, value);
            let mut read = buf.freeze();
            assert_eq!(read_vlong(&mut read).unwrap(), value);
        }
    }

    #[test]
    fn test_vlong_single_byte_for_small_values() {
        let mut buf = BytesMut::new();
        write_vlong(&mut buf, 42);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_zlong_small_negatives_stay_small() {
        let mut buf = BytesMut::new();
        write_zlong(&mut buf, -1);
        assert_eq!(buf.len(), 1);
        let mut read = buf.freeze();
        assert_eq!(read_zlong(&mut read).unwrap(), -1);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "héllo wörld");
        let mut read = buf.freeze();
        assert_eq!(read_string(&mut read).unwrap(), "héllo wörld");
    }

    #[test]
    fn test_truncated_input_fails_cleanly() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "something long enough");
        let mut truncated = buf.freeze().slice(0..5);
        assert!(read_string(&mut truncated).is_err());
        assert!(read_vlong(&mut bytes::Bytes::new()).is_err());
    }

    #[test]
    fn test_value_roundtrips() {
        let value = json!({
            "name": "shard",
            "number": 3,
            "negative": -17,
            "ratio": 0.25,
            "active": true,
            "missing": null,
            "tags": ["a", "b", "c"],
            "nested": {"deep": [1, 2, {"x": false}]}
        });
        assert_eq!(roundtrip_value(&value), value);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(99);
        let mut read = buf.freeze();
        assert!(read_value(&mut read).is_err());
    }

    proptest! {
        #[test]
        fn prop_vlong_roundtrip(value: u64) {
            let mut buf = BytesMut::new();
            write_vlong(&mut buf, value);
            let mut read = buf.freeze();
            prop_assert_eq!(read_vlong(&mut read).unwrap(), value);
        }

        #[test]
        fn prop_zlong_roundtrip(value: i64) {
            let mut buf = BytesMut::new();
            write_zlong(&mut buf, value);
            let mut read = buf.freeze();
            prop_assert_eq!(read_zlong(&mut read).unwrap(), value);
        }

        #[test]
        fn prop_string_roundtrip(value in ".*") {
            let mut buf = BytesMut::new();
            write_string(&mut buf, &value);
            let mut read = buf.freeze();
            prop_assert_eq!(read_string(&mut read).unwrap(), value);
        }
    }
}

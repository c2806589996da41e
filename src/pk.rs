//! Composite primary-key codec.
//!
//! Tracked rows are addressed by an opaque byte string so metadata tables
//! and change records handle any key shape uniformly. The encoding is
//! deterministic: equal keys produce identical bytes on every replica,
//! which makes the bytes directly comparable and safe to use as a lookup
//! key.
//!
//! Layout: a count byte, then per key column a type tag followed by a
//! big-endian body. Integers and reals are fixed 8 bytes; text and blobs
//! carry a u32 length prefix.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::types::Value;

const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// Encode the typed key columns of one row into the canonical byte form.
///
/// `Value::Null` is refused: a NULL can never identify a row across
/// replicas.
pub fn encode_pk(values: &[Value]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(Error::UnsupportedKeyType("empty primary key".to_string()));
    }
    if values.len() > u8::MAX as usize {
        return Err(Error::UnsupportedKeyType(format!(
            "primary key has {} columns, limit is {}",
            values.len(),
            u8::MAX
        )));
    }

    let mut buf = Vec::with_capacity(1 + values.len() * 9);
    buf.put_u8(values.len() as u8);
    for value in values {
        match value {
            Value::Integer(i) => {
                buf.put_u8(TAG_INTEGER);
                buf.put_i64(*i);
            }
            Value::Real(f) => {
                buf.put_u8(TAG_REAL);
                buf.put_u64(f.to_bits());
            }
            Value::Text(t) => {
                if t.len() > u32::MAX as usize {
                    return Err(Error::UnsupportedKeyType("text key column too large".to_string()));
                }
                buf.put_u8(TAG_TEXT);
                buf.put_u32(t.len() as u32);
                buf.put_slice(t.as_bytes());
            }
            Value::Blob(b) => {
                if b.len() > u32::MAX as usize {
                    return Err(Error::UnsupportedKeyType("blob key column too large".to_string()));
                }
                buf.put_u8(TAG_BLOB);
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
            Value::Null => {
                return Err(Error::UnsupportedKeyType("NULL in primary key".to_string()));
            }
        }
    }
    Ok(buf)
}

/// Decode canonical key bytes back into typed column values.
pub fn decode_pk(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut buf = bytes;
    if buf.remaining() < 1 {
        return Err(Error::MalformedPayload("empty key encoding".to_string()));
    }
    let count = buf.get_u8() as usize;
    if count == 0 {
        return Err(Error::MalformedPayload("key encoding declares zero columns".to_string()));
    }

    let mut values = Vec::with_capacity(count);
    for idx in 0..count {
        if buf.remaining() < 1 {
            return Err(Error::MalformedPayload(format!("key truncated before column {idx}")));
        }
        let tag = buf.get_u8();
        let value = match tag {
            TAG_INTEGER => {
                if buf.remaining() < 8 {
                    return Err(Error::MalformedPayload(format!("key truncated in integer column {idx}")));
                }
                Value::Integer(buf.get_i64())
            }
            TAG_REAL => {
                if buf.remaining() < 8 {
                    return Err(Error::MalformedPayload(format!("key truncated in real column {idx}")));
                }
                Value::Real(f64::from_bits(buf.get_u64()))
            }
            TAG_TEXT | TAG_BLOB => {
                if buf.remaining() < 4 {
                    return Err(Error::MalformedPayload(format!("key truncated in length of column {idx}")));
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(Error::MalformedPayload(format!(
                        "key column {idx} declares {len} bytes, {} remain",
                        buf.remaining()
                    )));
                }
                let body = buf[..len].to_vec();
                buf.advance(len);
                if tag == TAG_TEXT {
                    let text = String::from_utf8(body).map_err(|_| {
                        Error::MalformedPayload(format!("key column {idx} is not valid UTF-8"))
                    })?;
                    Value::Text(text)
                } else {
                    Value::Blob(body)
                }
            }
            other => {
                return Err(Error::MalformedPayload(format!("unknown key type tag {other}")));
            }
        };
        values.push(value);
    }

    if buf.has_remaining() {
        return Err(Error::MalformedPayload(format!(
            "{} trailing bytes after key columns",
            buf.remaining()
        )));
    }
    Ok(values)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_integer_key_roundtrip() {
        let key = vec![Value::Integer(42)];
        let bytes = encode_pk(&key).unwrap();
        assert_eq!(bytes.len(), 1 + 1 + 8);
        assert_eq!(decode_pk(&bytes).unwrap(), key);
    }

    #[test]
    fn test_negative_integer_key_roundtrip() {
        let key = vec![Value::Integer(i64::MIN)];
        let bytes = encode_pk(&key).unwrap();
        assert_eq!(decode_pk(&bytes).unwrap(), key);
    }

    #[test]
    fn test_text_key_roundtrip() {
        let key = vec![Value::Text("user-épsilon".to_string())];
        let bytes = encode_pk(&key).unwrap();
        assert_eq!(decode_pk(&bytes).unwrap(), key);
    }

    #[test]
    fn test_real_key_roundtrip() {
        let key = vec![Value::Real(-2.5)];
        let bytes = encode_pk(&key).unwrap();
        assert_eq!(decode_pk(&bytes).unwrap(), key);
    }

    #[test]
    fn test_blob_key_roundtrip() {
        let key = vec![Value::Blob(vec![0, 1, 255, 128])];
        let bytes = encode_pk(&key).unwrap();
        assert_eq!(decode_pk(&bytes).unwrap(), key);
    }

    #[test]
    fn test_composite_key_roundtrip() {
        let key = vec![
            Value::Integer(7),
            Value::Text("shard-a".to_string()),
            Value::Blob(vec![9, 9]),
        ];
        let bytes = encode_pk(&key).unwrap();
        assert_eq!(bytes[0], 3);
        assert_eq!(decode_pk(&bytes).unwrap(), key);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let key = vec![Value::Integer(1), Value::Text("k".to_string())];
        assert_eq!(encode_pk(&key).unwrap(), encode_pk(&key).unwrap());
    }

    #[test]
    fn test_distinct_keys_encode_differently() {
        let a = encode_pk(&[Value::Integer(1)]).unwrap();
        let b = encode_pk(&[Value::Integer(2)]).unwrap();
        assert_ne!(a, b);
        // An integer 1 and the text "1" must not collide either.
        let c = encode_pk(&[Value::Text("1".to_string())]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_null_key_rejected() {
        let err = encode_pk(&[Value::Integer(1), Value::Null]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_empty_key_rejected() {
        let err = encode_pk(&[]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_decode_empty_input() {
        let err = decode_pk(&[]).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn test_decode_zero_column_count() {
        let err = decode_pk(&[0]).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn test_decode_truncated_integer() {
        let mut bytes = encode_pk(&[Value::Integer(42)]).unwrap();
        bytes.truncate(bytes.len() - 3);
        let err = decode_pk(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn test_decode_truncated_text_body() {
        let mut bytes = encode_pk(&[Value::Text("abcdef".to_string())]).unwrap();
        bytes.truncate(bytes.len() - 2);
        let err = decode_pk(&bytes).unwrap_err();
        assert!(err.to_string().contains("declares"));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let bytes = vec![1, 99, 0, 0];
        let err = decode_pk(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown key type tag"));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode_pk(&[Value::Integer(1)]).unwrap();
        bytes.push(0xff);
        let err = decode_pk(&bytes).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_decode_invalid_utf8_text() {
        let mut bytes = vec![1, TAG_TEXT];
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        let err = decode_pk(&bytes).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }
}

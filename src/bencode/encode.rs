//! Bencode encoder
//!
//! Dictionaries are emitted in sorted key order, which `BTreeMap` already
//! guarantees, so output is canonical.

use bytes::{BufMut, BytesMut};

use super::value::Value;

/// Encode a value into a fresh buffer
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.to_vec()
}

/// Append the encoding of `value` to an existing buffer
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => put_bytes(b, buf),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(map) => {
            buf.put_u8(b'd');
            for (key, item) in map {
                put_bytes(key, buf);
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn put_bytes(b: &[u8], buf: &mut BytesMut) {
    buf.put_slice(b.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Integer(42)), b"i42e");
        assert_eq!(encode(&Value::Integer(-3)), b"i-3e");
        assert_eq!(encode(&Value::string("spam")), b"4:spam");
    }

    #[test]
    fn test_encode_sorts_keys() {
        let v = Value::dict().with("zeta", 1i64).with("alpha", 2i64);
        assert_eq!(encode(&v), b"d5:alphai2e4:zetai1ee");
    }

    #[test]
    fn test_encode_list() {
        let v = Value::List(vec![Value::string("a"), Value::Integer(1)]);
        assert_eq!(encode(&v), b"l1:ai1ee");
    }
}

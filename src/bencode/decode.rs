//! Bencode decoder
//!
//! Strict decoder: rejects leading zeros, `-0`, non-bytes dictionary keys
//! and trailing input.

use std::collections::BTreeMap;
use tracing::trace;

use super::value::{BencodeError, Value};

/// Maximum nesting accepted before the input is considered hostile
pub const MAX_DEPTH: usize = 64;

/// Decode exactly one value spanning the whole input
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingData {
            consumed,
            total: data.len(),
        });
    }
    Ok(value)
}

/// Decode one value from the start of the input.
///
/// Returns the value and the number of bytes it occupied; anything after
/// that is left for the caller (ut_metadata appends raw piece data after the
/// dictionary).
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value(0)?;
    trace!("Decoded bencode {} ({} of {} bytes)", value.type_name(), decoder.pos, data.len());
    Ok((value, decoder.pos))
}

/// Raw encoded bytes of `key` inside a top-level dictionary.
///
/// The info hash must be computed over the exact bytes that appeared in the
/// file, so re-encoding the parsed value is not good enough.
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>, BencodeError> {
    let mut decoder = Decoder::new(data);
    decoder.expect(b'd')?;
    while decoder.peek()? != b'e' {
        let key_pos = decoder.pos;
        let current = match decoder.value(1)? {
            Value::Bytes(b) => b,
            _ => return Err(BencodeError::InvalidKey { position: key_pos }),
        };
        let start = decoder.pos;
        decoder.value(1)?;
        if current == key {
            return Ok(Some(&data[start..decoder.pos]));
        }
    }
    Ok(None)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn expect(&mut self, byte: u8) -> Result<(), BencodeError> {
        let found = self.peek()?;
        if found != byte {
            return Err(BencodeError::UnexpectedByte {
                byte: found,
                position: self.pos,
            });
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes(),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                position: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|p| start + p)
            .ok_or(BencodeError::UnexpectedEof)?;

        let text = std::str::from_utf8(&self.data[start..end])
            .map_err(|_| BencodeError::InvalidInteger("not ascii".to_string()))?;
        if text.is_empty() || text == "-" {
            return Err(BencodeError::InvalidInteger("empty".to_string()));
        }
        if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
            return Err(BencodeError::InvalidInteger(format!("leading zero in {}", text)));
        }
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.to_string()))?;

        self.pos = end + 1;
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos;
        let colon = self.data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|p| start + p)
            .ok_or(BencodeError::UnexpectedEof)?;

        let digits = &self.data[start..colon];
        if digits.is_empty()
            || !digits.iter().all(u8::is_ascii_digit)
            || (digits.len() > 1 && digits[0] == b'0')
        {
            return Err(BencodeError::InvalidLength { position: start });
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength { position: start })?;

        let body = colon + 1;
        let end = body.checked_add(len).ok_or(BencodeError::InvalidLength { position: start })?;
        if end > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        self.pos = end;
        Ok(Value::Bytes(self.data[body..end].to_vec()))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            let key = match self.value(depth + 1)? {
                Value::Bytes(b) => b,
                _ => return Err(BencodeError::InvalidKey { position: key_pos }),
            };
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::string("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_nested() {
        let v = decode(b"d1:ad1:bli1ei2eee1:c3:xyze").unwrap();
        let inner = v.get(b"a").unwrap();
        assert_eq!(inner.get_list(b"b").unwrap().len(), 2);
        assert_eq!(v.get_str(b"c"), Some("xyz"));
    }

    #[test]
    fn test_reject_malformed_integers() {
        assert!(matches!(decode(b"i03e"), Err(BencodeError::InvalidInteger(_))));
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger(_))));
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger(_))));
        assert!(matches!(decode(b"i12"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn test_reject_bad_strings() {
        assert!(matches!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"03:abc"), Err(BencodeError::InvalidLength { .. })));
    }

    #[test]
    fn test_reject_trailing_data() {
        assert!(matches!(
            decode(b"i1ei2e"),
            Err(BencodeError::TrailingData { consumed: 3, total: 6 })
        ));
    }

    #[test]
    fn test_reject_non_bytes_key() {
        assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::InvalidKey { .. })));
    }

    #[test]
    fn test_depth_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(matches!(decode(&data), Err(BencodeError::NestingTooDeep)));
    }

    #[test]
    fn test_decode_prefix_leaves_tail() {
        let data = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let (value, used) = decode_prefix(data).unwrap();
        assert_eq!(value.get_int(b"msg_type"), Some(1));
        assert_eq!(&data[used..], b"RAWDATA");
    }

    #[test]
    fn test_raw_dict_value() {
        let data = b"d8:announce3:url4:infod4:name1:xee";
        let raw = raw_dict_value(data, b"info").unwrap().unwrap();
        assert_eq!(raw, b"d4:name1:xe");
        assert!(raw_dict_value(data, b"missing").unwrap().is_none());
    }
}

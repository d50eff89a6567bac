//! Bencode value model
//!
//! A dynamically typed bencode value plus typed accessors.

use std::collections::BTreeMap;
use std::fmt;

/// Dictionary type used by [`Value::Dict`]; keys stay sorted for canonical encoding
pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A single bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed integer (`i...e`)
    Integer(i64),
    /// Raw byte string (`<len>:<bytes>`), not necessarily UTF-8
    Bytes(Vec<u8>),
    /// List (`l...e`)
    List(Vec<Value>),
    /// Dictionary with byte-string keys (`d...e`)
    Dict(Dict),
}

impl Value {
    /// Empty dictionary, handy as a builder starting point
    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    /// Byte string from UTF-8 text
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8, `None` when it is not valid text
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key when this value is a dictionary
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_list(&self, key: &[u8]) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn get_dict(&self, key: &[u8]) -> Option<&Dict> {
        self.get(key).and_then(Value::as_dict)
    }

    /// Insert into a dictionary value, returning `self` for chaining.
    ///
    /// Non-dictionary values are left untouched.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Dict(d) = &mut self {
            d.insert(key.as_bytes().to_vec(), value.into());
        }
        self
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(v.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 20]> for Value {
    fn from(v: [u8; 20]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Dict> for Value {
    fn from(v: Dict) -> Self {
        Value::Dict(v)
    }
}

/// Decoding failures of the bencode codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value
    UnexpectedEof,
    /// A byte that cannot start or continue a value
    UnexpectedByte { byte: u8, position: usize },
    /// Malformed integer (empty, leading zeros, `-0`, overflow)
    InvalidInteger(String),
    /// Malformed byte-string length prefix
    InvalidLength { position: usize },
    /// Dictionary key that is not a byte string
    InvalidKey { position: usize },
    /// Nesting deeper than the decoder allows
    NestingTooDeep,
    /// Bytes left after a complete top-level value
    TrailingData { consumed: usize, total: usize },
}

impl fmt::Display for BencodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BencodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            BencodeError::UnexpectedByte { byte, position } => {
                write!(f, "unexpected byte 0x{:02x} at {}", byte, position)
            }
            BencodeError::InvalidInteger(s) => write!(f, "invalid integer: {}", s),
            BencodeError::InvalidLength { position } => {
                write!(f, "invalid string length at {}", position)
            }
            BencodeError::InvalidKey { position } => {
                write!(f, "dictionary key at {} is not a byte string", position)
            }
            BencodeError::NestingTooDeep => write!(f, "nesting too deep"),
            BencodeError::TrailingData { consumed, total } => {
                write!(f, "trailing data: consumed {} of {} bytes", consumed, total)
            }
        }
    }
}

impl std::error::Error for BencodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let v = Value::dict()
            .with("n", 7i64)
            .with("s", "text")
            .with("l", vec![Value::Integer(1)]);

        assert_eq!(v.get_int(b"n"), Some(7));
        assert_eq!(v.get_str(b"s"), Some("text"));
        assert_eq!(v.get_list(b"l").map(|l| l.len()), Some(1));
        assert!(v.get(b"missing").is_none());
        assert_eq!(v.type_name(), "dict");
    }

    #[test]
    fn test_as_str_rejects_invalid_utf8() {
        let v = Value::Bytes(vec![0xff, 0xfe]);
        assert!(v.as_str().is_none());
        assert_eq!(v.as_bytes(), Some(&[0xff, 0xfe][..]));
    }

    #[test]
    fn test_with_on_non_dict_is_noop() {
        let v = Value::Integer(1).with("k", 2i64);
        assert_eq!(v, Value::Integer(1));
    }
}

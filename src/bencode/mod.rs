//! Bencode codec
//!
//! The self-describing format shared by torrent files, DHT datagrams,
//! tracker responses and extension messages.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_prefix, raw_dict_value};
pub use encode::{encode, encode_into};
pub use value::{BencodeError, Dict, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Integer),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                proptest::collection::btree_map(
                    proptest::collection::vec(any::<u8>(), 0..12),
                    inner,
                    0..8
                )
                .prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_round_trip(v in arb_value()) {
            let encoded = encode(&v);
            prop_assert_eq!(decode(&encoded).unwrap(), v);
        }
    }

    #[test]
    fn test_round_trip_dht_query() {
        let query = Value::dict()
            .with("t", "aa")
            .with("y", "q")
            .with("q", "ping")
            .with("a", Value::dict().with("id", [7u8; 20]));
        let encoded = encode(&query);
        assert_eq!(decode(&encoded).unwrap(), query);
    }
}

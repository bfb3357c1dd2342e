//! Block encoding for everything that gets hashed or signed.
//!
//! All wire structures are DAG-CBOR. Maps are emitted with canonically
//! ordered keys, so `decode(encode(x))` followed by `encode` is byte-identical
//! as long as every field survives the trip, which is what the
//! [`UnknownFields`] bag is for: wire structs flatten it in so that fields
//! written by newer clients are carried through re-encoding untouched.

use std::collections::BTreeMap;

use ipld_core::codec::Codec;
use ipld_core::ipld::Ipld;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_ipld_dagcbor::codec::DagCborCodec;

/// Fields present on the wire that this client does not understand
pub type UnknownFields = BTreeMap<String, Ipld>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// A type with a canonical DAG-CBOR block encoding
pub trait BlockEncoded: Serialize + DeserializeOwned + Sized {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        decode(data)
    }
}

pub fn encode<T: Serialize + DeserializeOwned>(value: &T) -> Result<Vec<u8>, CodecError> {
    DagCborCodec::encode_to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: Serialize + DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    DagCborCodec::decode_from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Compare two values by their encodings
pub fn encoded_equal<T: Serialize + DeserializeOwned>(a: &T, b: &T) -> Result<bool, CodecError> {
    Ok(encode(a)? == encode(b)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Old {
        a: u64,
        #[serde(flatten)]
        unknown: UnknownFields,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct New {
        a: u64,
        b: String,
        c: Vec<u64>,
    }

    #[test]
    fn test_unknown_fields_survive_reencoding() {
        let new = New {
            a: 7,
            b: "from the future".to_string(),
            c: vec![1, 2, 3],
        };
        let bytes = encode(&new).unwrap();

        let old: Old = decode(&bytes).unwrap();
        assert_eq!(old.a, 7);
        assert_eq!(old.unknown.len(), 2);

        let reencoded = encode(&old).unwrap();
        assert_eq!(bytes, reencoded);

        let back: New = decode(&reencoded).unwrap();
        assert_eq!(back, new);
    }

    #[test]
    fn test_encoded_equal() {
        let x = Old {
            a: 1,
            unknown: UnknownFields::new(),
        };
        let mut y = x.clone();
        assert!(encoded_equal(&x, &y).unwrap());
        y.a = 2;
        assert!(!encoded_equal(&x, &y).unwrap());
    }
}

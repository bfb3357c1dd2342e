//! Typed, versioned content hashes
//!
//! Every identifier in the metadata layer is derived from a [`Hash`]: metadata
//! IDs, key bundle IDs, server half IDs and Merkle leaf hashes. A hash is a
//! single type byte followed by the raw digest:
//!
//! ```text
//! [ type: 1 byte ][ digest: 32..=128 bytes ]
//! ```
//!
//! Unknown-but-nonzero type bytes are accepted so that hashes produced by
//! newer clients can be carried around and compared; they just cannot be
//! recomputed locally.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac as HmacImpl, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Shortest valid encoded hash (type byte + 32-byte digest)
pub const MIN_HASH_BYTE_LENGTH: usize = 33;
/// Length of a hash produced with [`DEFAULT_HASH_TYPE`]
pub const DEFAULT_HASH_BYTE_LENGTH: usize = 33;
/// Longest valid encoded hash (type byte + 128-byte digest)
pub const MAX_HASH_BYTE_LENGTH: usize = 129;
/// Algorithm used by [`Hash::default_hash`] and [`Hmac::default_hmac`]
pub const DEFAULT_HASH_TYPE: HashType = HashType::SHA256;

/// Raw digest produced by the default algorithm
pub type RawDefaultHash = [u8; DEFAULT_HASH_BYTE_LENGTH - 1];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash: {0}")]
    InvalidHash(String),
    #[error("unknown hash type {0}")]
    UnknownHashType(HashType),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },
    #[error("invalid hash hex: {0}")]
    InvalidHex(String),
}

/// The algorithm tag stored in the first byte of a [`Hash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashType(u8);

impl HashType {
    /// Reserved, never valid on the wire
    pub const INVALID: HashType = HashType(0);
    /// SHA-256 over the encoded bytes
    pub const SHA256: HashType = HashType(1);
    /// SHA-256 over block payloads encrypted with a key-derived nonce
    pub const SHA256_V2: HashType = HashType(2);

    pub fn from_u8(value: u8) -> Self {
        HashType(value)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Whether this client knows how to compute digests of this type
    pub fn is_known(&self) -> bool {
        matches!(*self, HashType::SHA256 | HashType::SHA256_V2)
    }

    fn digest(&self, buf: &[u8]) -> Result<RawDefaultHash, HashError> {
        match *self {
            HashType::SHA256 | HashType::SHA256_V2 => Ok(Sha256::digest(buf).into()),
            other => Err(HashError::UnknownHashType(other)),
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HashType::INVALID => write!(f, "invalid"),
            HashType::SHA256 => write!(f, "sha256"),
            HashType::SHA256_V2 => write!(f, "sha256-v2"),
            HashType(other) => write!(f, "unknown({})", other),
        }
    }
}

/// A typed content hash.
///
/// The zero value (no bytes at all) is distinct from every real hash and
/// encodes to an empty byte string.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(Vec<u8>);

impl Hash {
    /// Hash `buf` with the default algorithm
    pub fn default_hash(buf: &[u8]) -> Hash {
        let raw: RawDefaultHash = Sha256::digest(buf).into();
        Hash::from_raw_unchecked(DEFAULT_HASH_TYPE, &raw)
    }

    /// Hash `buf` with the given algorithm
    pub fn do_hash(buf: &[u8], hash_type: HashType) -> Result<Hash, HashError> {
        let raw = hash_type.digest(buf)?;
        Ok(Hash::from_raw_unchecked(hash_type, &raw))
    }

    /// Build a hash from a type tag and a raw digest, validating the result
    pub fn from_raw(hash_type: HashType, raw: &[u8]) -> Result<Hash, HashError> {
        let hash = Hash::from_raw_unchecked(hash_type, raw);
        hash.validate()?;
        Ok(hash)
    }

    fn from_raw_unchecked(hash_type: HashType, raw: &[u8]) -> Hash {
        let mut bytes = Vec::with_capacity(raw.len() + 1);
        bytes.push(hash_type.as_u8());
        bytes.extend_from_slice(raw);
        Hash(bytes)
    }

    /// Parse an encoded hash. An empty slice yields the zero value.
    pub fn from_bytes(bytes: &[u8]) -> Result<Hash, HashError> {
        if bytes.is_empty() {
            return Ok(Hash::default());
        }
        let hash = Hash(bytes.to_vec());
        hash.validate()?;
        Ok(hash)
    }

    /// Parse a hex encoded hash. An empty string yields the zero value.
    pub fn from_hex(s: &str) -> Result<Hash, HashError> {
        let bytes = hex::decode(s).map_err(|e| HashError::InvalidHex(e.to_string()))?;
        Hash::from_bytes(&bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    fn validate(&self) -> Result<(), HashError> {
        if self.0.len() < MIN_HASH_BYTE_LENGTH {
            return Err(HashError::InvalidHash(format!(
                "hash too short: {} bytes",
                self.0.len()
            )));
        }
        if self.0.len() > MAX_HASH_BYTE_LENGTH {
            return Err(HashError::InvalidHash(format!(
                "hash too long: {} bytes",
                self.0.len()
            )));
        }
        if self.hash_type() == HashType::INVALID {
            return Err(HashError::InvalidHash("invalid hash type".to_string()));
        }
        Ok(())
    }

    pub fn hash_type(&self) -> HashType {
        self.0
            .first()
            .map(|b| HashType::from_u8(*b))
            .unwrap_or(HashType::INVALID)
    }

    /// The digest without its type byte
    pub fn digest_bytes(&self) -> &[u8] {
        if self.0.is_empty() {
            &[]
        } else {
            &self.0[1..]
        }
    }

    /// The full encoding, type byte included
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Check that `buf` hashes to this value
    pub fn verify(&self, buf: &[u8]) -> Result<(), HashError> {
        self.validate()?;
        let actual = Hash::do_hash(buf, self.hash_type())?;
        if actual != *self {
            return Err(HashError::HashMismatch {
                expected: self.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Boolean form of [`Hash::verify`]
    pub fn is_hash_of(&self, buf: &[u8]) -> bool {
        self.verify(buf).is_ok()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{Error, SeqAccess, Visitor};

        struct HashVisitor;

        impl<'de> Visitor<'de> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an encoded hash byte string")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: Error,
            {
                Hash::from_bytes(v).map_err(E::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut bytes = Vec::new();
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Hash::from_bytes(&bytes).map_err(A::Error::custom)
            }
        }

        deserializer.deserialize_byte_buf(HashVisitor)
    }
}

/// A keyed MAC sharing the [`Hash`] representation
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hmac(Hash);

impl Hmac {
    /// HMAC-SHA256 of `buf` under `key`
    pub fn default_hmac(key: &[u8], buf: &[u8]) -> Hmac {
        let mut mac = HmacImpl::<Sha256>::new_from_slice(key)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(buf);
        let raw = mac.finalize().into_bytes();
        Hmac(Hash::from_raw_unchecked(DEFAULT_HASH_TYPE, &raw))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Hmac, HashError> {
        Ok(Hmac(Hash::from_bytes(bytes)?))
    }

    pub fn from_hex(s: &str) -> Result<Hmac, HashError> {
        Ok(Hmac(Hash::from_hex(s)?))
    }

    pub fn hash(&self) -> &Hash {
        &self.0
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }

    /// Recompute the MAC of `buf` under `key` and compare
    pub fn verify(&self, key: &[u8], buf: &[u8]) -> Result<(), HashError> {
        self.0.validate()?;
        if self.0.hash_type() != DEFAULT_HASH_TYPE {
            return Err(HashError::UnknownHashType(self.0.hash_type()));
        }
        let actual = Hmac::default_hmac(key, buf);
        if actual != *self {
            return Err(HashError::HashMismatch {
                expected: self.0.clone(),
                actual: actual.0,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Hmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Hmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hmac({})", self.0.to_hex())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_hash_verifies() {
        let data = b"root metadata bytes";
        let hash = Hash::default_hash(data);
        assert_eq!(hash.bytes().len(), DEFAULT_HASH_BYTE_LENGTH);
        assert_eq!(hash.hash_type(), HashType::SHA256);
        assert!(hash.verify(data).is_ok());
        assert!(matches!(
            hash.verify(b"other bytes"),
            Err(HashError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_validity_bounds() {
        assert!(Hash::from_bytes(&[1u8; MIN_HASH_BYTE_LENGTH - 1]).is_err());
        assert!(Hash::from_bytes(&[1u8; MAX_HASH_BYTE_LENGTH + 1]).is_err());
        assert!(Hash::from_bytes(&[1u8; MAX_HASH_BYTE_LENGTH]).is_ok());

        // reserved invalid type
        let mut invalid = vec![0u8; DEFAULT_HASH_BYTE_LENGTH];
        invalid[0] = HashType::INVALID.as_u8();
        assert!(Hash::from_bytes(&invalid).is_err());
    }

    #[test]
    fn test_unknown_type_is_valid_but_not_verifiable() {
        let raw = [7u8; 32];
        let hash = Hash::from_raw(HashType::from_u8(0xfe), &raw).unwrap();
        assert!(hash.is_valid());
        assert!(!hash.hash_type().is_known());
        assert!(matches!(
            hash.verify(b"anything"),
            Err(HashError::UnknownHashType(_))
        ));
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = Hash::default_hash(b"hex me");
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!(Hash::from_hex("zz").is_err());
    }

    #[test]
    fn test_zero_value_encoding() {
        use ipld_core::codec::Codec;
        use serde_ipld_dagcbor::codec::DagCborCodec;

        let zero = Hash::default();
        assert!(zero.is_zero());
        assert!(!zero.is_valid());
        assert_eq!(zero.to_hex(), "");
        assert_eq!(Hash::from_hex("").unwrap(), zero);

        let encoded = DagCborCodec::encode_to_vec(&zero).unwrap();
        let real = DagCborCodec::encode_to_vec(&Hash::default_hash(b"x")).unwrap();
        assert_ne!(encoded, real);
        let decoded: Hash = DagCborCodec::decode_from_slice(&encoded).unwrap();
        assert_eq!(decoded, zero);

        let decoded_real: Hash = DagCborCodec::decode_from_slice(&real).unwrap();
        assert_eq!(decoded_real, Hash::default_hash(b"x"));
    }

    #[test]
    fn test_hmac() {
        let key = [3u8; 32];
        let mac = Hmac::default_hmac(&key, b"message");
        assert!(mac.verify(&key, b"message").is_ok());
        assert!(mac.verify(&[4u8; 32], b"message").is_err());
        assert!(mac.verify(&key, b"messagf").is_err());
        assert_ne!(*mac.hash(), Hash::default_hash(b"message"));
        assert_eq!(Hmac::from_hex(&mac.hash().to_hex()).unwrap(), mac);
    }
}

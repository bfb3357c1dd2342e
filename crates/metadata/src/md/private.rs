use serde::{Deserialize, Serialize};

use crate::codec::{self, UnknownFields};
use crate::crypto::{decrypt_data, encrypt_data, EncryptedData, TlfCryptKey, TlfPrivateKey};

use super::errors::MdError;

/// The part of a revision only key holders can read.
///
/// Directory roots and change lists live here too, but this layer only
/// interprets the folder private key; everything else rides along in
/// `unknown`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlf_private_key: Option<TlfPrivateKey>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl PrivateMetadata {
    /// Encode and encrypt with the given generation's crypt key
    pub fn seal(&self, key: &TlfCryptKey) -> Result<Vec<u8>, MdError> {
        let encoded = codec::encode(self)?;
        let encrypted = encrypt_data(&encoded, key.bytes())?;
        Ok(codec::encode(&encrypted)?)
    }

    pub fn open(serialized: &[u8], key: &TlfCryptKey) -> Result<Self, MdError> {
        let encrypted: EncryptedData = codec::decode(serialized)?;
        let encoded = decrypt_data(&encrypted, key.bytes())?;
        Ok(codec::decode(&encoded)?)
    }

    /// Public folders store private metadata unencrypted
    pub fn encode_plain(&self) -> Result<Vec<u8>, MdError> {
        Ok(codec::encode(self)?)
    }

    pub fn decode_plain(serialized: &[u8]) -> Result<Self, MdError> {
        Ok(codec::decode(serialized)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = TlfCryptKey::generate();
        let pmd = PrivateMetadata {
            tlf_private_key: Some(TlfPrivateKey::generate()),
            unknown: UnknownFields::new(),
        };
        let sealed = pmd.seal(&key).unwrap();
        assert_eq!(PrivateMetadata::open(&sealed, &key).unwrap(), pmd);
        assert!(PrivateMetadata::open(&sealed, &TlfCryptKey::generate()).is_err());
    }
}

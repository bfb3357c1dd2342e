//! Key bundles stored outside the metadata object (versions 3 and 4)
//!
//! Only the latest key generation has bundles; earlier crypt keys travel
//! encrypted with the latest one inside the writer bundle. The metadata
//! carries the content hashes of the two bundles, and the bundles themselves
//! are passed around explicitly as [`ExtraMetadataV3`].
//!
//! Unlike V2, every ephemeral key index is a plain non-negative index into
//! the bundle's own `ephemeral_public_keys`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{self, UnknownFields};
use crate::crypto::{
    EncryptedTlfCryptKeys, TlfCryptKey, TlfEphemeralPublicKey, TlfPublicKey,
};
use crate::hash::Hash;

use super::errors::MdError;
use super::key_bundle::UserDeviceKeyInfoMap;
use super::key_bundle_v2::{EphemeralKeyLocation, ReaderKeyBundleV2, WriterKeyBundleV2};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterKeyBundleV3 {
    pub keys: UserDeviceKeyInfoMap,
    pub tlf_public_key: TlfPublicKey,
    pub ephemeral_public_keys: Vec<TlfEphemeralPublicKey>,
    /// All earlier generations' crypt keys, oldest first, encrypted with the
    /// latest crypt key
    pub encrypted_historic_crypt_keys: EncryptedTlfCryptKeys,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReaderKeyBundleV3 {
    pub keys: UserDeviceKeyInfoMap,
    pub ephemeral_public_keys: Vec<TlfEphemeralPublicKey>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

macro_rules! key_bundle_id {
    ($(#[$meta:meta])* $name:ident, $bundle:ty) => {
        $(#[$meta])*
        #[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Hash);

        impl $name {
            /// The content address of `bundle`
            pub fn make(bundle: &$bundle) -> Result<Self, MdError> {
                Ok($name(Hash::default_hash(&codec::encode(bundle)?)))
            }

            pub fn from_hash(hash: Hash) -> Self {
                $name(hash)
            }

            pub fn hash(&self) -> &Hash {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            /// Check that `bundle` hashes to this ID
            pub fn verify(&self, bundle: &$bundle) -> Result<(), MdError> {
                let actual = $name::make(bundle)?;
                if actual != *self {
                    return Err(MdError::KeyBundleIdMismatch {
                        expected: self.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Ok(())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

key_bundle_id!(
    /// Content address of a [`WriterKeyBundleV3`]
    TlfWriterKeyBundleId,
    WriterKeyBundleV3
);

key_bundle_id!(
    /// Content address of a [`ReaderKeyBundleV3`]
    TlfReaderKeyBundleId,
    ReaderKeyBundleV3
);

/// The out-of-band key bundles that accompany a V3 metadata object.
///
/// `wkb_new` / `rkb_new` mark bundles that changed relative to the
/// predecessor and therefore have to be uploaded alongside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraMetadataV3 {
    pub wkb: WriterKeyBundleV3,
    pub rkb: ReaderKeyBundleV3,
    pub wkb_new: bool,
    pub rkb_new: bool,
}

impl ExtraMetadataV3 {
    pub fn new(wkb: WriterKeyBundleV3, rkb: ReaderKeyBundleV3, wkb_new: bool, rkb_new: bool) -> Self {
        ExtraMetadataV3 {
            wkb,
            rkb,
            wkb_new,
            rkb_new,
        }
    }

    /// A copy for a successor: same bundles, nothing new yet
    pub fn successor_copy(&self) -> Self {
        ExtraMetadataV3 {
            wkb: self.wkb.clone(),
            rkb: self.rkb.clone(),
            wkb_new: false,
            rkb_new: false,
        }
    }

    pub fn ids(&self) -> Result<(TlfWriterKeyBundleId, TlfReaderKeyBundleId), MdError> {
        Ok((
            TlfWriterKeyBundleId::make(&self.wkb)?,
            TlfReaderKeyBundleId::make(&self.rkb)?,
        ))
    }

    /// Decrypt every earlier generation's crypt key
    pub fn historic_crypt_keys(&self, current: &TlfCryptKey) -> Result<Vec<TlfCryptKey>, MdError> {
        if self.wkb.encrypted_historic_crypt_keys.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.wkb.encrypted_historic_crypt_keys.decrypt(current)?)
    }
}

/// Convert the latest V2 writer bundle. Every writer index must point into
/// the writer ephemeral list.
pub(crate) fn writer_key_bundle_from_v2(
    wkb: &WriterKeyBundleV2,
    historic_keys: &[TlfCryptKey],
    current_key: &TlfCryptKey,
) -> Result<WriterKeyBundleV3, MdError> {
    let count = wkb.ephemeral_public_keys.len();
    for (_, devices) in wkb.keys.iter() {
        for info in devices.values() {
            let index = info.ephemeral_public_key_index;
            if index < 0 || index as usize >= count {
                return Err(MdError::InvalidEphemeralKeyIndex { index, count });
            }
        }
    }
    Ok(WriterKeyBundleV3 {
        keys: wkb.keys.clone(),
        tlf_public_key: wkb.tlf_public_key,
        ephemeral_public_keys: wkb.ephemeral_public_keys.clone(),
        encrypted_historic_crypt_keys: EncryptedTlfCryptKeys::encrypt(historic_keys, current_key)?,
        unknown: UnknownFields::new(),
    })
}

/// Convert the latest V2 reader bundle.
///
/// The V3 reader ephemeral list is the writer list followed by the reader
/// list, so non-negative indices are unchanged and `-1 - i` becomes
/// `writer_count + i`.
pub(crate) fn reader_key_bundle_from_v2(
    wkb: &WriterKeyBundleV2,
    rkb: &ReaderKeyBundleV2,
) -> Result<ReaderKeyBundleV3, MdError> {
    let writer_count = wkb.ephemeral_public_keys.len();
    let reader_count = rkb.reader_ephemeral_public_keys.len();
    let mut keys = rkb.keys.clone();
    for (_, devices) in keys.iter_mut() {
        for info in devices.values_mut() {
            let index = info.ephemeral_public_key_index;
            let converted = match EphemeralKeyLocation::from_index(index) {
                EphemeralKeyLocation::Writer(i) if i < writer_count => i,
                EphemeralKeyLocation::Reader(i) if i < reader_count => writer_count + i,
                _ => {
                    return Err(MdError::InvalidEphemeralKeyIndex {
                        index,
                        count: writer_count + reader_count,
                    })
                }
            };
            info.ephemeral_public_key_index = converted as i64;
        }
    }
    let mut ephemeral_public_keys = wkb.ephemeral_public_keys.clone();
    ephemeral_public_keys.extend(rkb.reader_ephemeral_public_keys.iter().copied());
    Ok(ReaderKeyBundleV3 {
        keys,
        ephemeral_public_keys,
        unknown: UnknownFields::new(),
    })
}

/// Resolve the ephemeral public key for a V3 entry
pub(crate) fn ephemeral_public_key_v3(
    index: i64,
    keys: &[TlfEphemeralPublicKey],
) -> Result<TlfEphemeralPublicKey, MdError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| keys.get(i))
        .copied()
        .ok_or(MdError::InvalidEphemeralKeyIndex {
            index,
            count: keys.len(),
        })
}

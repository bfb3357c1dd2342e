//! Key bundles embedded in the metadata object (versions 1 and 2)
//!
//! Every key generation has one writer bundle and one reader bundle. Writer
//! entries index into the writer bundle's ephemeral keys. Reader entries use
//! a signed index: `i >= 0` points into the *writer* bundle's ephemeral keys,
//! `i < 0` points at `reader_ephemeral_public_keys[-1 - i]`. The negative
//! range lets a reader rekey its own devices without touching anything a
//! writer signed.

use serde::{Deserialize, Serialize};

use crate::codec::UnknownFields;
use crate::crypto::{TlfEphemeralPublicKey, TlfPublicKey};

use super::errors::MdError;
use super::key_bundle::UserDeviceKeyInfoMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterKeyBundleV2 {
    pub keys: UserDeviceKeyInfoMap,
    /// Folder public key for this generation
    pub tlf_public_key: TlfPublicKey,
    pub ephemeral_public_keys: Vec<TlfEphemeralPublicKey>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReaderKeyBundleV2 {
    pub keys: UserDeviceKeyInfoMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reader_ephemeral_public_keys: Vec<TlfEphemeralPublicKey>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

/// Writer bundles indexed by `key_gen - 1`
pub type WriterKeyGenerationsV2 = Vec<WriterKeyBundleV2>;
/// Reader bundles indexed by `key_gen - 1`
pub type ReaderKeyGenerationsV2 = Vec<ReaderKeyBundleV2>;

/// Convert a reader ephemeral list position into its signed index
pub(crate) fn reader_ephemeral_index(position: usize) -> i64 {
    -1 - position as i64
}

/// Where a V2 ephemeral key index points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EphemeralKeyLocation {
    Writer(usize),
    Reader(usize),
}

impl EphemeralKeyLocation {
    pub(crate) fn from_index(index: i64) -> Self {
        if index >= 0 {
            EphemeralKeyLocation::Writer(index as usize)
        } else {
            EphemeralKeyLocation::Reader((-1 - index) as usize)
        }
    }
}

/// Resolve the ephemeral public key for a V2 entry
pub fn ephemeral_public_key_v2(
    index: i64,
    wkb: &WriterKeyBundleV2,
    rkb: &ReaderKeyBundleV2,
) -> Result<TlfEphemeralPublicKey, MdError> {
    let (keys, position) = match EphemeralKeyLocation::from_index(index) {
        EphemeralKeyLocation::Writer(i) => (&wkb.ephemeral_public_keys, i),
        EphemeralKeyLocation::Reader(i) => (&rkb.reader_ephemeral_public_keys, i),
    };
    keys.get(position)
        .copied()
        .ok_or(MdError::InvalidEphemeralKeyIndex {
            index,
            count: keys.len(),
        })
}

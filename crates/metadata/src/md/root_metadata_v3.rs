//! Root metadata with externally stored key bundles (versions 3 and 4)

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::codec::{self, UnknownFields};
use crate::crypto::{
    CryptPublicKey, EncryptedTlfCryptKeys, TlfCryptKey, TlfEphemeralPrivateKey,
    TlfEphemeralPublicKey, TlfPublicKey,
};
use crate::tlf::{HandleExtension, SocialAssertion, TlfHandle, TlfId, UserId};

use super::errors::MdError;
use super::key_bundle::{
    ServerHalfRemovalInfo, TlfCryptKeyInfo, UserDeviceKeyInfoMap, UserDevicePublicKeys,
    UserDeviceServerHalves,
};
use super::key_bundle_v3::{
    ephemeral_public_key_v3, ExtraMetadataV3, ReaderKeyBundleV3, TlfReaderKeyBundleId,
    TlfWriterKeyBundleId, WriterKeyBundleV3,
};
use super::types::{BranchId, KeyGen, MetadataFlags, MetadataId, MetadataVer, Revision, WriterFlags};

/// The part of a V3 revision signed by its last writer
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterMetadataV3 {
    #[serde_as(as = "Bytes")]
    pub serialized_private_metadata: Vec<u8>,
    pub last_modifying_writer: UserId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writers: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_writers: Vec<SocialAssertion>,
    pub id: TlfId,
    pub bid: BranchId,
    pub flags: WriterFlags,
    pub disk_usage: u64,
    pub md_disk_usage: u64,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
    pub md_ref_bytes: u64,
    pub latest_key_gen: KeyGen,
    #[serde(default, skip_serializing_if = "TlfWriterKeyBundleId::is_zero")]
    pub wkb_id: TlfWriterKeyBundleId,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootMetadataV3 {
    pub version: MetadataVer,
    pub writer_metadata: WriterMetadataV3,
    pub last_modifying_user: UserId,
    pub flags: MetadataFlags,
    pub revision: Revision,
    pub prev_root: MetadataId,
    #[serde(default, skip_serializing_if = "TlfReaderKeyBundleId::is_zero")]
    pub rkb_id: TlfReaderKeyBundleId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_readers: Vec<SocialAssertion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<HandleExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_info: Option<HandleExtension>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl RootMetadataV3 {
    pub fn make_initial(version: MetadataVer, tlf_id: TlfId, handle: &TlfHandle) -> Self {
        let (writers, latest_key_gen) = if tlf_id.is_public() {
            (handle.writers.clone(), KeyGen::PUBLIC)
        } else {
            (Vec::new(), KeyGen::UNSPECIFIED)
        };
        RootMetadataV3 {
            version,
            writer_metadata: WriterMetadataV3 {
                writers,
                unresolved_writers: handle.unresolved_writers.clone(),
                id: tlf_id,
                latest_key_gen,
                ..Default::default()
            },
            revision: Revision::INITIAL,
            unresolved_readers: handle.unresolved_readers.clone(),
            conflict_info: handle.conflict_info.clone(),
            finalized_info: handle.finalized_info.clone(),
            ..Default::default()
        }
    }

    pub fn latest_key_generation(&self) -> KeyGen {
        if self.writer_metadata.id.is_public() {
            KeyGen::PUBLIC
        } else {
            self.writer_metadata.latest_key_gen
        }
    }

    /// Check that `extra` is present when keys exist and matches the
    /// recorded bundle IDs
    pub fn check_extra<'a>(&self, extra: Option<&'a ExtraMetadataV3>) -> Result<Option<&'a ExtraMetadataV3>, MdError> {
        if !self.latest_key_generation().is_valid() {
            return Ok(extra);
        }
        let extra = extra.ok_or_else(|| {
            MdError::MissingKeyBundle(format!(
                "writer {} / reader {}",
                self.writer_metadata.wkb_id, self.rkb_id
            ))
        })?;
        self.writer_metadata.wkb_id.verify(&extra.wkb)?;
        self.rkb_id.verify(&extra.rkb)?;
        Ok(Some(extra))
    }

    fn keyed_extra<'a>(&self, extra: Option<&'a ExtraMetadataV3>) -> Result<&'a ExtraMetadataV3, MdError> {
        if self.writer_metadata.id.is_public() {
            return Err(MdError::PublicFolder);
        }
        self.check_extra(extra)?.ok_or(MdError::InvalidKeyGeneration {
            key_gen: KeyGen::FIRST_VALID,
            latest: self.latest_key_generation(),
        })
    }

    /// Record the IDs of the (possibly changed) bundles in `extra`, marking
    /// the changed ones as new
    pub fn update_bundle_ids(&mut self, extra: &mut ExtraMetadataV3) -> Result<(), MdError> {
        let (wkb_id, rkb_id) = extra.ids()?;
        if wkb_id != self.writer_metadata.wkb_id {
            self.writer_metadata.wkb_id = wkb_id;
            extra.wkb_new = true;
        }
        if rkb_id != self.rkb_id {
            self.rkb_id = rkb_id;
            extra.rkb_new = true;
        }
        Ok(())
    }

    pub fn tlf_public_key(&self, extra: Option<&ExtraMetadataV3>) -> Option<TlfPublicKey> {
        if !self.latest_key_generation().is_valid() {
            return None;
        }
        extra.map(|extra| extra.wkb.tlf_public_key)
    }

    /// Key info and ephemeral key a device needs to open the latest
    /// generation. Older generations are only reachable through the
    /// historic key list.
    pub fn key_info_for_device(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<(TlfCryptKeyInfo, TlfEphemeralPublicKey), MdError> {
        let latest = self.latest_key_generation();
        if key_gen != latest {
            return Err(MdError::InvalidKeyGeneration { key_gen, latest });
        }
        let extra = self.keyed_extra(extra)?;
        if let Some(info) = extra.wkb.keys.key_info(uid, device) {
            let ephemeral =
                ephemeral_public_key_v3(info.ephemeral_public_key_index, &extra.wkb.ephemeral_public_keys)?;
            return Ok((info.clone(), ephemeral));
        }
        let info = extra
            .rkb
            .keys
            .key_info(uid, device)
            .ok_or(MdError::MissingKeyInfo { uid: *uid, key_gen })?;
        let ephemeral =
            ephemeral_public_key_v3(info.ephemeral_public_key_index, &extra.rkb.ephemeral_public_keys)?;
        Ok((info.clone(), ephemeral))
    }

    pub fn is_writer(&self, uid: &UserId, device: Option<&CryptPublicKey>, extra: Option<&ExtraMetadataV3>) -> bool {
        if self.writer_metadata.id.is_public() {
            return self.writer_metadata.writers.contains(uid);
        }
        let Some(extra) = extra else {
            return false;
        };
        match device {
            Some(device) => extra.wkb.keys.key_info(uid, device).is_some(),
            None => extra.wkb.keys.contains_user(uid),
        }
    }

    pub fn is_reader(&self, uid: &UserId, device: Option<&CryptPublicKey>, extra: Option<&ExtraMetadataV3>) -> bool {
        if self.writer_metadata.id.is_public() {
            return true;
        }
        if self.is_writer(uid, device, extra) {
            return true;
        }
        let Some(extra) = extra else {
            return false;
        };
        match device {
            Some(device) => extra.rkb.keys.key_info(uid, device).is_some(),
            None => extra.rkb.keys.contains_user(uid),
        }
    }

    pub fn user_device_public_keys(
        &self,
        extra: Option<&ExtraMetadataV3>,
    ) -> (UserDevicePublicKeys, UserDevicePublicKeys) {
        match extra {
            Some(extra) if self.latest_key_generation().is_valid() => {
                (extra.wkb.keys.to_public_keys(), extra.rkb.keys.to_public_keys())
            }
            _ => Default::default(),
        }
    }

    /// Start a new key generation. The previous generation's key (if any)
    /// joins the historic list, encrypted with `crypt_key`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_key_generation(
        &mut self,
        prev_extra: Option<&ExtraMetadataV3>,
        prev_crypt_key: Option<&TlfCryptKey>,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
        ephemeral: &TlfEphemeralPrivateKey,
        tlf_public_key: TlfPublicKey,
        crypt_key: &TlfCryptKey,
    ) -> Result<(ExtraMetadataV3, UserDeviceServerHalves), MdError> {
        if self.writer_metadata.id.is_public() {
            return Err(MdError::PublicFolder);
        }
        let mut historic = Vec::new();
        if self.latest_key_generation().is_valid() {
            let prev_extra = self.check_extra(prev_extra)?.ok_or_else(|| {
                MdError::MissingKeyBundle("previous generation bundles".to_string())
            })?;
            let prev_crypt_key = prev_crypt_key.ok_or(MdError::KeyCountMismatch {
                expected: 1,
                actual: 0,
            })?;
            historic = prev_extra.historic_crypt_keys(prev_crypt_key)?;
            historic.push(*prev_crypt_key);
        }

        let mut wkb = WriterKeyBundleV3 {
            keys: UserDeviceKeyInfoMap::new(),
            tlf_public_key,
            ephemeral_public_keys: vec![ephemeral.public()],
            encrypted_historic_crypt_keys: EncryptedTlfCryptKeys::encrypt(&historic, crypt_key)?,
            unknown: UnknownFields::new(),
        };
        let mut rkb = ReaderKeyBundleV3 {
            keys: UserDeviceKeyInfoMap::new(),
            ephemeral_public_keys: vec![ephemeral.public()],
            unknown: UnknownFields::new(),
        };
        let mut halves = wkb
            .keys
            .fill_in_user_infos(0, updated_writer_keys, ephemeral, crypt_key)?;
        halves.extend(
            rkb.keys
                .fill_in_user_infos(0, updated_reader_keys, ephemeral, crypt_key)?,
        );

        let mut extra = ExtraMetadataV3::new(wkb, rkb, false, false);
        let latest = self.latest_key_generation();
        self.writer_metadata.latest_key_gen = latest
            .checked_next()
            .ok_or_else(|| MdError::Invalid(format!("key generation {} has no successor", latest)))?;
        self.update_bundle_ids(&mut extra)?;
        Ok((extra, halves))
    }

    /// Give every new device an entry in the latest generation.
    /// `crypt_keys` must hold exactly the latest crypt key.
    pub fn update_key_bundles(
        &mut self,
        extra: &mut ExtraMetadataV3,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
        ephemeral: &TlfEphemeralPrivateKey,
        crypt_keys: &[TlfCryptKey],
    ) -> Result<Vec<UserDeviceServerHalves>, MdError> {
        self.keyed_extra(Some(extra))?;
        let [crypt_key] = crypt_keys else {
            return Err(MdError::KeyCountMismatch {
                expected: 1,
                actual: crypt_keys.len(),
            });
        };

        let writer_index = extra.wkb.ephemeral_public_keys.len() as i64;
        let mut halves =
            extra
                .wkb
                .keys
                .fill_in_user_infos(writer_index, updated_writer_keys, ephemeral, crypt_key)?;
        if !halves.is_empty() {
            extra.wkb.ephemeral_public_keys.push(ephemeral.public());
        }

        let reader_index = extra.rkb.ephemeral_public_keys.len() as i64;
        let reader_halves =
            extra
                .rkb
                .keys
                .fill_in_user_infos(reader_index, updated_reader_keys, ephemeral, crypt_key)?;
        if !reader_halves.is_empty() {
            extra.rkb.ephemeral_public_keys.push(ephemeral.public());
        }
        halves.extend(reader_halves);

        self.update_bundle_ids(extra)?;
        Ok(vec![halves])
    }

    pub fn revoke_removed_devices(
        &mut self,
        extra: &mut ExtraMetadataV3,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
    ) -> Result<ServerHalfRemovalInfo, MdError> {
        self.keyed_extra(Some(extra))?;
        let writers = extra.wkb.keys.remove_devices_not_in(updated_writer_keys);
        let readers = extra.rkb.keys.remove_devices_not_in(updated_reader_keys);
        let removal = writers.merge_users(&readers)?;
        self.update_bundle_ids(extra)?;
        Ok(removal)
    }

    /// Move `readers` into the writer bundle
    pub fn promote_readers(
        &mut self,
        extra: &mut ExtraMetadataV3,
        readers: &BTreeSet<UserId>,
    ) -> Result<(), MdError> {
        self.keyed_extra(Some(extra))?;
        let key_gen = self.latest_key_generation();
        for uid in readers {
            let mut devices = extra
                .rkb
                .keys
                .remove(uid)
                .ok_or(MdError::MissingKeyInfo { uid: *uid, key_gen })?;
            for info in devices.values_mut() {
                let ephemeral = ephemeral_public_key_v3(
                    info.ephemeral_public_key_index,
                    &extra.rkb.ephemeral_public_keys,
                )?;
                let position = match extra
                    .wkb
                    .ephemeral_public_keys
                    .iter()
                    .position(|k| *k == ephemeral)
                {
                    Some(p) => p,
                    None => {
                        extra.wkb.ephemeral_public_keys.push(ephemeral);
                        extra.wkb.ephemeral_public_keys.len() - 1
                    }
                };
                info.ephemeral_public_key_index = position as i64;
            }
            extra.wkb.keys.insert(*uid, devices);
        }
        self.update_bundle_ids(extra)
    }

    /// A copied revision is a valid reader rekey if nothing but `user`'s
    /// reader entries (and appended reader ephemeral keys) changed
    pub fn is_valid_rekey_request(
        &self,
        prev: &RootMetadataV3,
        user: &UserId,
        prev_extra: Option<&ExtraMetadataV3>,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<bool, MdError> {
        if !self.flags.contains(MetadataFlags::WRITER_METADATA_COPIED) {
            return Ok(false);
        }
        if !codec::encoded_equal(&self.writer_metadata, &prev.writer_metadata)? {
            return Ok(false);
        }
        let (Some(prev_extra), Some(extra)) = (prev.check_extra(prev_extra)?, self.check_extra(extra)?)
        else {
            return Ok(false);
        };
        if !codec::encoded_equal(&extra.wkb, &prev_extra.wkb)? {
            return Ok(false);
        }
        let prev_keys = &prev_extra.rkb.ephemeral_public_keys;
        if !prev_keys
            .iter()
            .eq(extra.rkb.ephemeral_public_keys.iter().take(prev_keys.len()))
        {
            return Ok(false);
        }
        let mut keys = extra.rkb.keys.clone();
        let mut prev_keys = prev_extra.rkb.keys.clone();
        keys.remove(user);
        prev_keys.remove(user);
        Ok(codec::encoded_equal(&keys, &prev_keys)?)
    }
}

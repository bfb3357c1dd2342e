//! Root metadata with embedded key bundles (versions 1 and 2)

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::codec::{self, UnknownFields};
use crate::crypto::{
    CryptPublicKey, TlfCryptKey, TlfEphemeralPrivateKey, TlfEphemeralPublicKey, TlfPublicKey,
};
use crate::tlf::{HandleExtension, SocialAssertion, TlfHandle, TlfId, UserId};

use super::errors::MdError;
use super::key_bundle::{
    ServerHalfRemovalInfo, TlfCryptKeyInfo, UserDeviceKeyInfoMap, UserDevicePublicKeys,
    UserDeviceServerHalves,
};
use super::key_bundle_v2::{
    ephemeral_public_key_v2, reader_ephemeral_index, EphemeralKeyLocation, ReaderKeyBundleV2,
    ReaderKeyGenerationsV2, WriterKeyBundleV2, WriterKeyGenerationsV2,
};
use super::key_bundle_v3::{
    reader_key_bundle_from_v2, writer_key_bundle_from_v2, ExtraMetadataV3,
};
use super::root_metadata_v3::{RootMetadataV3, WriterMetadataV3};
use super::types::{BranchId, KeyGen, MetadataFlags, MetadataId, MetadataVer, Revision, WriterFlags};

/// The part of a V2 revision signed by its last writer
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterMetadataV2 {
    #[serde_as(as = "Bytes")]
    pub serialized_private_metadata: Vec<u8>,
    pub last_modifying_writer: UserId,
    /// Writers of a public folder
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
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wkeys: WriterKeyGenerationsV2,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootMetadataV2 {
    pub version: MetadataVer,
    pub writer_metadata: WriterMetadataV2,
    pub last_modifying_user: UserId,
    pub flags: MetadataFlags,
    pub revision: Revision,
    pub prev_root: MetadataId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rkeys: ReaderKeyGenerationsV2,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_readers: Vec<SocialAssertion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<HandleExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_info: Option<HandleExtension>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl RootMetadataV2 {
    pub fn make_initial(version: MetadataVer, tlf_id: TlfId, handle: &TlfHandle) -> Self {
        let writers = if tlf_id.is_public() {
            handle.writers.clone()
        } else {
            Vec::new()
        };
        RootMetadataV2 {
            version,
            writer_metadata: WriterMetadataV2 {
                writers,
                unresolved_writers: handle.unresolved_writers.clone(),
                id: tlf_id,
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
            KeyGen::from_count(self.writer_metadata.wkeys.len())
        }
    }

    pub(crate) fn check_generations(&self) -> Result<(), MdError> {
        if self.writer_metadata.wkeys.len() != self.rkeys.len() {
            return Err(MdError::Invalid(format!(
                "{} writer key generations but {} reader key generations",
                self.writer_metadata.wkeys.len(),
                self.rkeys.len()
            )));
        }
        Ok(())
    }

    fn bundles(&self, key_gen: KeyGen) -> Result<(&WriterKeyBundleV2, &ReaderKeyBundleV2), MdError> {
        if self.writer_metadata.id.is_public() {
            return Err(MdError::PublicFolder);
        }
        let invalid = || MdError::InvalidKeyGeneration {
            key_gen,
            latest: self.latest_key_generation(),
        };
        let index = key_gen.index().ok_or_else(invalid)?;
        match (self.writer_metadata.wkeys.get(index), self.rkeys.get(index)) {
            (Some(wkb), Some(rkb)) => Ok((wkb, rkb)),
            _ => Err(invalid()),
        }
    }

    pub fn tlf_public_key(&self) -> Option<TlfPublicKey> {
        self.writer_metadata.wkeys.last().map(|wkb| wkb.tlf_public_key)
    }

    /// Key info and ephemeral key a device needs to open `key_gen`
    pub fn key_info_for_device(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
    ) -> Result<(TlfCryptKeyInfo, TlfEphemeralPublicKey), MdError> {
        let (wkb, rkb) = self.bundles(key_gen)?;
        let info = wkb
            .keys
            .key_info(uid, device)
            .or_else(|| rkb.keys.key_info(uid, device))
            .ok_or(MdError::MissingKeyInfo { uid: *uid, key_gen })?;
        let ephemeral = ephemeral_public_key_v2(info.ephemeral_public_key_index, wkb, rkb)?;
        Ok((info.clone(), ephemeral))
    }

    pub fn is_writer(&self, uid: &UserId, device: Option<&CryptPublicKey>) -> bool {
        if self.writer_metadata.id.is_public() {
            return self.writer_metadata.writers.contains(uid);
        }
        let Some(wkb) = self.writer_metadata.wkeys.last() else {
            return false;
        };
        match device {
            Some(device) => wkb.keys.key_info(uid, device).is_some(),
            None => wkb.keys.contains_user(uid),
        }
    }

    pub fn is_reader(&self, uid: &UserId, device: Option<&CryptPublicKey>) -> bool {
        if self.writer_metadata.id.is_public() {
            return true;
        }
        if self.is_writer(uid, device) {
            return true;
        }
        let Some(rkb) = self.rkeys.last() else {
            return false;
        };
        match device {
            Some(device) => rkb.keys.key_info(uid, device).is_some(),
            None => rkb.keys.contains_user(uid),
        }
    }

    /// Writer and reader devices recorded in the latest generation
    pub fn user_device_public_keys(&self) -> (UserDevicePublicKeys, UserDevicePublicKeys) {
        match (self.writer_metadata.wkeys.last(), self.rkeys.last()) {
            (Some(wkb), Some(rkb)) => (wkb.keys.to_public_keys(), rkb.keys.to_public_keys()),
            _ => Default::default(),
        }
    }

    pub fn add_key_generation(
        &mut self,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
        ephemeral: &TlfEphemeralPrivateKey,
        tlf_public_key: TlfPublicKey,
        crypt_key: &TlfCryptKey,
    ) -> Result<UserDeviceServerHalves, MdError> {
        if self.writer_metadata.id.is_public() {
            return Err(MdError::PublicFolder);
        }
        self.check_generations()?;

        let mut wkb = WriterKeyBundleV2 {
            keys: UserDeviceKeyInfoMap::new(),
            tlf_public_key,
            ephemeral_public_keys: vec![ephemeral.public()],
            unknown: UnknownFields::new(),
        };
        let mut rkb = ReaderKeyBundleV2::default();
        let mut halves = wkb
            .keys
            .fill_in_user_infos(0, updated_writer_keys, ephemeral, crypt_key)?;
        // readers share the writer ephemeral key at index 0
        halves.extend(
            rkb.keys
                .fill_in_user_infos(0, updated_reader_keys, ephemeral, crypt_key)?,
        );
        self.writer_metadata.wkeys.push(wkb);
        self.rkeys.push(rkb);
        Ok(halves)
    }

    /// Give every new device in the update sets an entry in every generation.
    /// `crypt_keys[i]` is the crypt key of generation `i + 1`.
    pub fn update_key_bundles(
        &mut self,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
        ephemeral: &TlfEphemeralPrivateKey,
        crypt_keys: &[TlfCryptKey],
    ) -> Result<Vec<UserDeviceServerHalves>, MdError> {
        self.check_generations()?;
        if crypt_keys.len() != self.writer_metadata.wkeys.len() {
            return Err(MdError::KeyCountMismatch {
                expected: self.writer_metadata.wkeys.len(),
                actual: crypt_keys.len(),
            });
        }

        let mut all = Vec::with_capacity(crypt_keys.len());
        for ((wkb, rkb), crypt_key) in self
            .writer_metadata
            .wkeys
            .iter_mut()
            .zip(self.rkeys.iter_mut())
            .zip(crypt_keys)
        {
            let writer_index = wkb.ephemeral_public_keys.len() as i64;
            let mut halves =
                wkb.keys
                    .fill_in_user_infos(writer_index, updated_writer_keys, ephemeral, crypt_key)?;
            if !halves.is_empty() {
                wkb.ephemeral_public_keys.push(ephemeral.public());
            }

            let reader_index = reader_ephemeral_index(rkb.reader_ephemeral_public_keys.len());
            let reader_halves =
                rkb.keys
                    .fill_in_user_infos(reader_index, updated_reader_keys, ephemeral, crypt_key)?;
            if !reader_halves.is_empty() {
                rkb.reader_ephemeral_public_keys.push(ephemeral.public());
            }
            halves.extend(reader_halves);
            all.push(halves);
        }
        Ok(all)
    }

    /// Drop every device not in the update sets from every generation
    pub fn revoke_removed_devices(
        &mut self,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
    ) -> Result<ServerHalfRemovalInfo, MdError> {
        self.check_generations()?;
        let mut total: Option<ServerHalfRemovalInfo> = None;
        for (wkb, rkb) in self
            .writer_metadata
            .wkeys
            .iter_mut()
            .zip(self.rkeys.iter_mut())
        {
            let writers = wkb.keys.remove_devices_not_in(updated_writer_keys);
            let readers = rkb.keys.remove_devices_not_in(updated_reader_keys);
            let generation = writers.merge_users(&readers)?;
            match total.as_mut() {
                Some(total) => total.add_generation(&generation)?,
                None => total = Some(generation),
            }
        }
        Ok(total.unwrap_or_default())
    }

    /// Move `readers` into the writer bundles of every generation
    pub fn promote_readers(&mut self, readers: &BTreeSet<UserId>) -> Result<(), MdError> {
        self.check_generations()?;
        for (i, (wkb, rkb)) in self
            .writer_metadata
            .wkeys
            .iter_mut()
            .zip(self.rkeys.iter_mut())
            .enumerate()
        {
            for uid in readers {
                let mut devices = rkb.keys.remove(uid).ok_or(MdError::MissingKeyInfo {
                    uid: *uid,
                    key_gen: KeyGen::from_count(i + 1),
                })?;
                for info in devices.values_mut() {
                    let index = info.ephemeral_public_key_index;
                    if let EphemeralKeyLocation::Reader(position) = EphemeralKeyLocation::from_index(index) {
                        let ephemeral = rkb
                            .reader_ephemeral_public_keys
                            .get(position)
                            .copied()
                            .ok_or(MdError::InvalidEphemeralKeyIndex {
                                index,
                                count: rkb.reader_ephemeral_public_keys.len(),
                            })?;
                        let writer_position = match wkb
                            .ephemeral_public_keys
                            .iter()
                            .position(|k| *k == ephemeral)
                        {
                            Some(p) => p,
                            None => {
                                wkb.ephemeral_public_keys.push(ephemeral);
                                wkb.ephemeral_public_keys.len() - 1
                            }
                        };
                        info.ephemeral_public_key_index = writer_position as i64;
                    }
                }
                wkb.keys.insert(*uid, devices);
            }
        }
        Ok(())
    }

    /// A copied revision is a valid reader rekey if nothing but `user`'s
    /// reader entries (and appended reader ephemeral keys) changed.
    pub fn is_valid_rekey_request(&self, prev: &RootMetadataV2, user: &UserId) -> Result<bool, MdError> {
        if !self.flags.contains(MetadataFlags::WRITER_METADATA_COPIED) {
            return Ok(false);
        }
        if !codec::encoded_equal(&self.writer_metadata, &prev.writer_metadata)? {
            return Ok(false);
        }
        if self.rkeys.len() != prev.rkeys.len() {
            return Ok(false);
        }
        for (rkb, prev_rkb) in self.rkeys.iter().zip(prev.rkeys.iter()) {
            if !prev_rkb
                .reader_ephemeral_public_keys
                .iter()
                .eq(rkb
                    .reader_ephemeral_public_keys
                    .iter()
                    .take(prev_rkb.reader_ephemeral_public_keys.len()))
            {
                return Ok(false);
            }
            let mut keys = rkb.keys.clone();
            let mut prev_keys = prev_rkb.keys.clone();
            keys.remove(user);
            prev_keys.remove(user);
            if !codec::encoded_equal(&keys, &prev_keys)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Convert to the segregated-bundle representation.
    ///
    /// `crypt_keys` must hold the crypt key of every generation, oldest
    /// first; the earlier ones are re-encrypted with the latest.
    pub(crate) fn up_convert(
        &self,
        version: MetadataVer,
        crypt_keys: &[TlfCryptKey],
    ) -> Result<(RootMetadataV3, Option<ExtraMetadataV3>), MdError> {
        let wm = &self.writer_metadata;
        let latest = self.latest_key_generation();
        let mut writer_metadata = WriterMetadataV3 {
            serialized_private_metadata: wm.serialized_private_metadata.clone(),
            last_modifying_writer: wm.last_modifying_writer,
            writers: wm.writers.clone(),
            unresolved_writers: wm.unresolved_writers.clone(),
            id: wm.id,
            bid: wm.bid,
            flags: wm.flags,
            disk_usage: wm.disk_usage,
            md_disk_usage: wm.md_disk_usage,
            ref_bytes: wm.ref_bytes,
            unref_bytes: wm.unref_bytes,
            md_ref_bytes: wm.md_ref_bytes,
            latest_key_gen: latest,
            wkb_id: Default::default(),
            unknown: wm.unknown.clone(),
        };

        let extra = match latest.index() {
            Some(index) => {
                self.check_generations()?;
                if crypt_keys.len() != wm.wkeys.len() {
                    return Err(MdError::KeyCountMismatch {
                        expected: wm.wkeys.len(),
                        actual: crypt_keys.len(),
                    });
                }
                let wkb_v2 = &wm.wkeys[index];
                let rkb_v2 = &self.rkeys[index];
                let wkb = writer_key_bundle_from_v2(wkb_v2, &crypt_keys[..index], &crypt_keys[index])?;
                let rkb = reader_key_bundle_from_v2(wkb_v2, rkb_v2)?;
                Some(ExtraMetadataV3::new(wkb, rkb, true, true))
            }
            None => None,
        };

        let mut md = RootMetadataV3 {
            version,
            writer_metadata: writer_metadata.clone(),
            last_modifying_user: self.last_modifying_user,
            flags: self.flags,
            revision: self.revision,
            prev_root: self.prev_root.clone(),
            rkb_id: Default::default(),
            unresolved_readers: self.unresolved_readers.clone(),
            conflict_info: self.conflict_info.clone(),
            finalized_info: self.finalized_info.clone(),
            unknown: self.unknown.clone(),
        };
        if let Some(extra) = &extra {
            let (wkb_id, rkb_id) = extra.ids()?;
            writer_metadata.wkb_id = wkb_id;
            md.writer_metadata = writer_metadata;
            md.rkb_id = rkb_id;
        }
        Ok((md, extra))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{CryptPrivateKey, TlfPrivateKey};
    use crate::tlf::TlfType;

    struct Fixture {
        md: RootMetadataV2,
        alice: UserId,
        a1: CryptPrivateKey,
        bob: UserId,
        b1: CryptPrivateKey,
        key: TlfCryptKey,
    }

    fn keyed() -> Fixture {
        let tlf = TlfId::generate(TlfType::Private);
        let mut md = RootMetadataV2::make_initial(MetadataVer::INITIAL_EXTRA, tlf, &TlfHandle::default());
        let alice = UserId::generate();
        let bob = UserId::generate();
        let a1 = CryptPrivateKey::generate();
        let b1 = CryptPrivateKey::generate();
        let key = TlfCryptKey::generate();
        md.add_key_generation(
            &UserDevicePublicKeys::from([(alice, BTreeSet::from([a1.public()]))]),
            &UserDevicePublicKeys::from([(bob, BTreeSet::from([b1.public()]))]),
            &TlfEphemeralPrivateKey::generate(),
            TlfPrivateKey::generate().public(),
            &key,
        )
        .unwrap();
        Fixture {
            md,
            alice,
            a1,
            bob,
            b1,
            key,
        }
    }

    #[test]
    fn test_add_key_generation() {
        let f = keyed();
        assert_eq!(f.md.latest_key_generation(), KeyGen::FIRST_VALID);
        assert!(f.md.is_writer(&f.alice, Some(&f.a1.public())));
        assert!(!f.md.is_writer(&f.bob, None));
        assert!(f.md.is_reader(&f.bob, Some(&f.b1.public())));

        let (info, ephemeral) = f
            .md
            .key_info_for_device(KeyGen::FIRST_VALID, &f.bob, &f.b1.public())
            .unwrap();
        assert_eq!(info.ephemeral_public_key_index, 0);
        assert!(info.client_half.open(&f.b1, &ephemeral).is_ok());

        assert!(matches!(
            f.md.key_info_for_device(KeyGen::new(2), &f.bob, &f.b1.public()),
            Err(MdError::InvalidKeyGeneration { .. })
        ));
    }

    #[test]
    fn test_reader_updates_use_negative_indices() {
        let mut f = keyed();
        let b2 = CryptPrivateKey::generate();
        let (writers, mut readers) = f.md.user_device_public_keys();
        readers.get_mut(&f.bob).unwrap().insert(b2.public());

        let halves = f
            .md
            .update_key_bundles(&writers, &readers, &TlfEphemeralPrivateKey::generate(), &[f.key])
            .unwrap();
        assert_eq!(halves.len(), 1);
        assert_eq!(halves[0][&f.bob].len(), 1);
        // no writer changed, so the writer ephemeral list is untouched
        assert_eq!(f.md.writer_metadata.wkeys[0].ephemeral_public_keys.len(), 1);
        assert_eq!(f.md.rkeys[0].reader_ephemeral_public_keys.len(), 1);

        let (info, ephemeral) = f
            .md
            .key_info_for_device(KeyGen::FIRST_VALID, &f.bob, &b2.public())
            .unwrap();
        assert_eq!(info.ephemeral_public_key_index, -1);
        assert!(info.client_half.open(&b2, &ephemeral).is_ok());

        assert!(matches!(
            f.md.update_key_bundles(&writers, &readers, &TlfEphemeralPrivateKey::generate(), &[]),
            Err(MdError::KeyCountMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_promote_reader_remaps_reader_ephemeral_keys() {
        let mut f = keyed();
        let b2 = CryptPrivateKey::generate();
        let (writers, mut readers) = f.md.user_device_public_keys();
        readers.get_mut(&f.bob).unwrap().insert(b2.public());
        f.md.update_key_bundles(&writers, &readers, &TlfEphemeralPrivateKey::generate(), &[f.key])
            .unwrap();

        f.md.promote_readers(&BTreeSet::from([f.bob])).unwrap();
        assert!(f.md.is_writer(&f.bob, Some(&b2.public())));
        assert!(!f.md.rkeys[0].keys.contains_user(&f.bob));
        for device in [&f.b1, &b2] {
            let (info, ephemeral) = f
                .md
                .key_info_for_device(KeyGen::FIRST_VALID, &f.bob, &device.public())
                .unwrap();
            assert!(info.ephemeral_public_key_index >= 0);
            assert!(info.client_half.open(device, &ephemeral).is_ok());
        }
        assert!(f.md.promote_readers(&BTreeSet::from([UserId::generate()])).is_err());
    }

    #[test]
    fn test_up_convert_requires_every_key() {
        let f = keyed();
        assert!(matches!(
            f.md.up_convert(MetadataVer::SEGREGATED_KEY_BUNDLES, &[]),
            Err(MdError::KeyCountMismatch { expected: 1, actual: 0 })
        ));

        let (v3, extra) = f
            .md
            .up_convert(MetadataVer::SEGREGATED_KEY_BUNDLES, &[f.key])
            .unwrap();
        let extra = extra.unwrap();
        assert_eq!(v3.writer_metadata.latest_key_gen, KeyGen::FIRST_VALID);
        assert_eq!(extra.ids().unwrap(), (v3.writer_metadata.wkb_id.clone(), v3.rkb_id.clone()));
        assert!(extra.historic_crypt_keys(&f.key).unwrap().is_empty());
        assert!(extra.wkb.keys.contains_user(&f.alice));
        assert!(extra.rkb.keys.contains_user(&f.bob));
    }
}

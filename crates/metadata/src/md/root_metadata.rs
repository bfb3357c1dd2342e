use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{
    CryptPublicKey, TlfCryptKey, TlfEphemeralPrivateKey, TlfEphemeralPublicKey, TlfPublicKey,
};
use crate::server::ServerError;
use crate::tlf::{HandleExtension, SocialAssertion, TlfHandle, TlfId, UserId};

use super::errors::MdError;
use super::key_bundle::{
    ServerHalfRemovalInfo, TlfCryptKeyInfo, UserDevicePublicKeys, UserDeviceServerHalves,
};
use super::key_bundle_v3::{ExtraMetadataV3, TlfReaderKeyBundleId, TlfWriterKeyBundleId};
use super::private::PrivateMetadata;
use super::root_metadata_v2::RootMetadataV2;
use super::root_metadata_v3::RootMetadataV3;
use super::types::{
    BranchId, KeyGen, MergeStatus, MetadataFlags, MetadataId, MetadataVer, Revision, WriterFlags,
};

/// A single revision of a folder's metadata, in whichever wire
/// representation its version calls for.
///
/// Versions 1 and 2 embed every key generation's bundles; version 3 and
/// later reference the latest generation's bundles by content hash and
/// expect them to be passed in as an [`ExtraMetadataV3`]. Versions newer
/// than [`MetadataVer::LATEST`] decode with the V3 layout so they can be
/// verified and forwarded, but refuse any operation that needs to
/// understand them.
#[derive(Debug, Clone, PartialEq)]
pub enum RootMetadata {
    V2(RootMetadataV2),
    V3(RootMetadataV3),
}

macro_rules! with_md {
    ($self:expr, $md:ident => $body:expr) => {
        match $self {
            RootMetadata::V2($md) => $body,
            RootMetadata::V3($md) => $body,
        }
    };
}

fn checked_usage(
    counter: &'static str,
    current: u64,
    bytes: u64,
    op: fn(u64, u64) -> Option<u64>,
) -> Result<u64, MdError> {
    op(current, bytes).ok_or(MdError::UsageOutOfRange {
        counter,
        current,
        bytes,
    })
}

#[derive(Serialize, Deserialize)]
struct VersionHeader {
    version: MetadataVer,
}

impl RootMetadata {
    /// The first revision of a new folder
    pub fn make_initial(version: MetadataVer, tlf_id: TlfId, handle: &TlfHandle) -> Result<Self, MdError> {
        if !version.is_valid() {
            return Err(MdError::Invalid(format!("cannot create metadata version {}", version)));
        }
        if version > MetadataVer::LATEST {
            return Err(MdError::UnsupportedVersion(version));
        }
        if tlf_id.is_zero() {
            return Err(MdError::Invalid("zero folder ID".to_string()));
        }
        Ok(if version.has_segregated_key_bundles() {
            RootMetadata::V3(RootMetadataV3::make_initial(version, tlf_id, handle))
        } else {
            RootMetadata::V2(RootMetadataV2::make_initial(version, tlf_id, handle))
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MdError> {
        Ok(with_md!(self, md => codec::encode(md))?)
    }

    /// Decode, choosing the representation from the version field alone
    pub fn decode(data: &[u8], min_version: MetadataVer) -> Result<Self, MdError> {
        let VersionHeader { version } = codec::decode(data)?;
        if !version.is_valid() {
            return Err(MdError::Invalid(format!("metadata version {}", version)));
        }
        if version < min_version {
            return Err(MdError::VersionTooOld {
                version,
                min: min_version,
            });
        }
        Ok(if version.has_segregated_key_bundles() {
            RootMetadata::V3(codec::decode(data)?)
        } else {
            RootMetadata::V2(codec::decode(data)?)
        })
    }

    /// Content address of this revision
    pub fn id(&self) -> Result<MetadataId, MdError> {
        Ok(MetadataId::from_encoded(&self.encode()?))
    }

    pub fn version(&self) -> MetadataVer {
        with_md!(self, md => md.version)
    }

    /// Fails for versions this client cannot fully interpret
    fn check_comprehended(&self) -> Result<(), MdError> {
        let version = self.version();
        if version > MetadataVer::LATEST {
            return Err(MdError::UnsupportedVersion(version));
        }
        Ok(())
    }

    pub fn tlf_id(&self) -> TlfId {
        with_md!(self, md => md.writer_metadata.id)
    }

    pub fn revision(&self) -> Revision {
        with_md!(self, md => md.revision)
    }

    pub fn set_revision(&mut self, revision: Revision) {
        with_md!(self, md => md.revision = revision)
    }

    pub fn prev_root(&self) -> &MetadataId {
        with_md!(self, md => &md.prev_root)
    }

    pub fn set_prev_root(&mut self, prev_root: MetadataId) {
        with_md!(self, md => md.prev_root = prev_root)
    }

    pub fn bid(&self) -> BranchId {
        with_md!(self, md => md.writer_metadata.bid)
    }

    pub fn flags(&self) -> MetadataFlags {
        with_md!(self, md => md.flags)
    }

    pub fn set_flag(&mut self, flag: u8) {
        with_md!(self, md => md.flags.set(flag))
    }

    pub fn clear_flag(&mut self, flag: u8) {
        with_md!(self, md => md.flags.clear(flag))
    }

    pub fn writer_flags(&self) -> WriterFlags {
        with_md!(self, md => md.writer_metadata.flags)
    }

    pub fn merged_status(&self) -> MergeStatus {
        if self.writer_flags().contains(WriterFlags::UNMERGED) {
            MergeStatus::Unmerged
        } else {
            MergeStatus::Merged
        }
    }

    /// Move this revision onto the unmerged branch `bid`
    pub fn set_unmerged(&mut self, bid: BranchId) {
        with_md!(self, md => {
            md.writer_metadata.flags.set(WriterFlags::UNMERGED);
            md.writer_metadata.bid = bid;
        })
    }

    /// Move this revision back onto the merged branch
    pub fn set_merged(&mut self) {
        with_md!(self, md => {
            md.writer_metadata.flags.clear(WriterFlags::UNMERGED);
            md.writer_metadata.bid = BranchId::NULL;
        })
    }

    pub fn is_final(&self) -> bool {
        self.flags().contains(MetadataFlags::FINAL)
    }

    pub fn is_rekey_set(&self) -> bool {
        self.flags().contains(MetadataFlags::REKEY)
    }

    pub fn is_writer_metadata_copied_set(&self) -> bool {
        self.flags().contains(MetadataFlags::WRITER_METADATA_COPIED)
    }

    pub fn last_modifying_writer(&self) -> UserId {
        with_md!(self, md => md.writer_metadata.last_modifying_writer)
    }

    pub fn set_last_modifying_writer(&mut self, uid: UserId) {
        with_md!(self, md => md.writer_metadata.last_modifying_writer = uid)
    }

    pub fn last_modifying_user(&self) -> UserId {
        with_md!(self, md => md.last_modifying_user)
    }

    pub fn set_last_modifying_user(&mut self, uid: UserId) {
        with_md!(self, md => md.last_modifying_user = uid)
    }

    pub fn disk_usage(&self) -> u64 {
        with_md!(self, md => md.writer_metadata.disk_usage)
    }

    pub fn set_disk_usage(&mut self, bytes: u64) {
        with_md!(self, md => md.writer_metadata.disk_usage = bytes)
    }

    pub fn md_disk_usage(&self) -> u64 {
        with_md!(self, md => md.writer_metadata.md_disk_usage)
    }

    pub fn set_md_disk_usage(&mut self, bytes: u64) {
        with_md!(self, md => md.writer_metadata.md_disk_usage = bytes)
    }

    pub fn ref_bytes(&self) -> u64 {
        with_md!(self, md => md.writer_metadata.ref_bytes)
    }

    pub fn unref_bytes(&self) -> u64 {
        with_md!(self, md => md.writer_metadata.unref_bytes)
    }

    pub fn md_ref_bytes(&self) -> u64 {
        with_md!(self, md => md.writer_metadata.md_ref_bytes)
    }

    /// Newly referenced block bytes. Leaves the counters untouched when
    /// either would overflow.
    pub fn add_ref_bytes(&mut self, bytes: u64) -> Result<(), MdError> {
        with_md!(self, md => {
            let wm = &mut md.writer_metadata;
            let ref_bytes = checked_usage("ref bytes", wm.ref_bytes, bytes, u64::checked_add)?;
            let disk_usage = checked_usage("disk usage", wm.disk_usage, bytes, u64::checked_add)?;
            wm.ref_bytes = ref_bytes;
            wm.disk_usage = disk_usage;
        });
        Ok(())
    }

    /// Block bytes no longer referenced
    pub fn add_unref_bytes(&mut self, bytes: u64) -> Result<(), MdError> {
        with_md!(self, md => {
            let wm = &mut md.writer_metadata;
            let unref_bytes = checked_usage("unref bytes", wm.unref_bytes, bytes, u64::checked_add)?;
            let disk_usage = checked_usage("disk usage", wm.disk_usage, bytes, u64::checked_sub)?;
            wm.unref_bytes = unref_bytes;
            wm.disk_usage = disk_usage;
        });
        Ok(())
    }

    /// Newly referenced metadata (change list) bytes
    pub fn add_md_ref_bytes(&mut self, bytes: u64) -> Result<(), MdError> {
        with_md!(self, md => {
            let wm = &mut md.writer_metadata;
            let md_ref_bytes = checked_usage("md ref bytes", wm.md_ref_bytes, bytes, u64::checked_add)?;
            let md_disk_usage =
                checked_usage("md disk usage", wm.md_disk_usage, bytes, u64::checked_add)?;
            wm.md_ref_bytes = md_ref_bytes;
            wm.md_disk_usage = md_disk_usage;
        });
        Ok(())
    }

    /// Adjust the total without recording a delta, e.g. when squashing
    pub fn add_disk_usage(&mut self, bytes: u64) -> Result<(), MdError> {
        with_md!(self, md => {
            let wm = &mut md.writer_metadata;
            wm.disk_usage = checked_usage("disk usage", wm.disk_usage, bytes, u64::checked_add)?;
        });
        Ok(())
    }

    pub fn unresolved_writers(&self) -> &[SocialAssertion] {
        with_md!(self, md => &md.writer_metadata.unresolved_writers)
    }

    pub fn unresolved_readers(&self) -> &[SocialAssertion] {
        with_md!(self, md => &md.unresolved_readers)
    }

    pub fn conflict_info(&self) -> Option<&HandleExtension> {
        with_md!(self, md => md.conflict_info.as_ref())
    }

    pub fn set_conflict_info(&mut self, info: Option<HandleExtension>) {
        with_md!(self, md => md.conflict_info = info)
    }

    pub fn finalized_info(&self) -> Option<&HandleExtension> {
        with_md!(self, md => md.finalized_info.as_ref())
    }

    pub fn set_finalized_info(&mut self, info: Option<HandleExtension>) {
        with_md!(self, md => md.finalized_info = info)
    }

    pub fn serialized_private_metadata(&self) -> &[u8] {
        with_md!(self, md => &md.writer_metadata.serialized_private_metadata)
    }

    /// Store `pmd`, encrypted with `crypt_key` for private folders
    pub fn set_private_metadata(
        &mut self,
        pmd: &PrivateMetadata,
        crypt_key: Option<&TlfCryptKey>,
    ) -> Result<(), MdError> {
        let serialized = match (self.tlf_id().is_public(), crypt_key) {
            (true, _) => pmd.encode_plain()?,
            (false, Some(key)) => pmd.seal(key)?,
            (false, None) => return Err(MdError::InvalidKeyGeneration {
                key_gen: KeyGen::UNSPECIFIED,
                latest: self.latest_key_generation(),
            }),
        };
        with_md!(self, md => md.writer_metadata.serialized_private_metadata = serialized);
        Ok(())
    }

    pub fn private_metadata(&self, crypt_key: Option<&TlfCryptKey>) -> Result<PrivateMetadata, MdError> {
        let serialized = self.serialized_private_metadata();
        match (self.tlf_id().is_public(), crypt_key) {
            (true, _) => PrivateMetadata::decode_plain(serialized),
            (false, Some(key)) => PrivateMetadata::open(serialized, key),
            (false, None) => Err(MdError::InvalidKeyGeneration {
                key_gen: KeyGen::UNSPECIFIED,
                latest: self.latest_key_generation(),
            }),
        }
    }

    pub(crate) fn writer_metadata_bytes(&self) -> Result<Vec<u8>, MdError> {
        Ok(with_md!(self, md => codec::encode(&md.writer_metadata))?)
    }

    pub fn latest_key_generation(&self) -> KeyGen {
        with_md!(self, md => md.latest_key_generation())
    }

    /// Check `extra` against the recorded bundle IDs (no-op for V2)
    pub fn check_extra<'a>(
        &self,
        extra: Option<&'a ExtraMetadataV3>,
    ) -> Result<Option<&'a ExtraMetadataV3>, MdError> {
        match self {
            RootMetadata::V2(_) => Ok(None),
            RootMetadata::V3(md) => md.check_extra(extra),
        }
    }

    /// IDs of the externally stored bundles of a keyed V3 revision
    pub fn key_bundle_ids(&self) -> Option<(TlfWriterKeyBundleId, TlfReaderKeyBundleId)> {
        match self {
            RootMetadata::V3(md) if md.latest_key_generation().is_valid() => {
                Some((md.writer_metadata.wkb_id.clone(), md.rkb_id.clone()))
            }
            _ => None,
        }
    }

    pub fn tlf_public_key(&self, extra: Option<&ExtraMetadataV3>) -> Option<TlfPublicKey> {
        match self {
            RootMetadata::V2(md) => md.tlf_public_key(),
            RootMetadata::V3(md) => md.tlf_public_key(extra),
        }
    }

    pub fn key_info_for_device(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<(TlfCryptKeyInfo, TlfEphemeralPublicKey), MdError> {
        self.check_comprehended()?;
        match self {
            RootMetadata::V2(md) => md.key_info_for_device(key_gen, uid, device),
            RootMetadata::V3(md) => md.key_info_for_device(key_gen, uid, device, extra),
        }
    }

    /// Whether `uid` (or the given device of `uid`) can write the latest
    /// generation
    pub fn is_writer(&self, uid: &UserId, device: Option<&CryptPublicKey>, extra: Option<&ExtraMetadataV3>) -> bool {
        match self {
            RootMetadata::V2(md) => md.is_writer(uid, device),
            RootMetadata::V3(md) => md.is_writer(uid, device, extra),
        }
    }

    pub fn is_reader(&self, uid: &UserId, device: Option<&CryptPublicKey>, extra: Option<&ExtraMetadataV3>) -> bool {
        match self {
            RootMetadata::V2(md) => md.is_reader(uid, device),
            RootMetadata::V3(md) => md.is_reader(uid, device, extra),
        }
    }

    /// Whether `uid` has at least one device keyed for the latest generation
    pub fn has_key_for_user(&self, uid: &UserId, extra: Option<&ExtraMetadataV3>) -> bool {
        if self.tlf_id().is_public() {
            return false;
        }
        let (writers, readers) = self.user_device_public_keys(extra);
        writers
            .get(uid)
            .or_else(|| readers.get(uid))
            .is_some_and(|devices| !devices.is_empty())
    }

    /// Writer and reader devices of the latest generation
    pub fn user_device_public_keys(
        &self,
        extra: Option<&ExtraMetadataV3>,
    ) -> (UserDevicePublicKeys, UserDevicePublicKeys) {
        match self {
            RootMetadata::V2(md) => md.user_device_public_keys(),
            RootMetadata::V3(md) => md.user_device_public_keys(extra),
        }
    }

    /// Membership as recorded in this revision
    pub fn handle(&self, extra: Option<&ExtraMetadataV3>) -> TlfHandle {
        let (writers, readers) = if self.tlf_id().is_public() {
            let writers = with_md!(self, md => md.writer_metadata.writers.clone());
            (writers, Vec::new())
        } else {
            let (writers, readers) = self.user_device_public_keys(extra);
            (writers.into_keys().collect(), readers.into_keys().collect())
        };
        TlfHandle {
            writers,
            readers,
            unresolved_writers: self.unresolved_writers().to_vec(),
            unresolved_readers: self.unresolved_readers().to_vec(),
            conflict_info: self.conflict_info().cloned(),
            finalized_info: self.finalized_info().cloned(),
        }
    }

    /// Start a new key generation.
    ///
    /// For V3, `prev_extra` and `prev_crypt_key` describe the generation
    /// being superseded (if any) and the returned extra replaces it.
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
    ) -> Result<(Option<ExtraMetadataV3>, UserDeviceServerHalves), MdError> {
        self.check_comprehended()?;
        let result = match self {
            RootMetadata::V2(md) => md
                .add_key_generation(
                    updated_writer_keys,
                    updated_reader_keys,
                    ephemeral,
                    tlf_public_key,
                    crypt_key,
                )
                .map(|halves| (None, halves)),
            RootMetadata::V3(md) => md
                .add_key_generation(
                    prev_extra,
                    prev_crypt_key,
                    updated_writer_keys,
                    updated_reader_keys,
                    ephemeral,
                    tlf_public_key,
                    crypt_key,
                )
                .map(|(extra, halves)| (Some(extra), halves)),
        }?;
        tracing::debug!(
            "added key generation {} to folder {}",
            self.latest_key_generation(),
            self.tlf_id()
        );
        Ok(result)
    }

    /// Key every new device in the update sets. V2 needs one crypt key per
    /// generation (oldest first); V3 needs just the latest.
    pub fn update_key_bundles(
        &mut self,
        extra: Option<&mut ExtraMetadataV3>,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
        ephemeral: &TlfEphemeralPrivateKey,
        crypt_keys: &[TlfCryptKey],
    ) -> Result<Vec<UserDeviceServerHalves>, MdError> {
        self.check_comprehended()?;
        match self {
            RootMetadata::V2(md) => {
                md.update_key_bundles(updated_writer_keys, updated_reader_keys, ephemeral, crypt_keys)
            }
            RootMetadata::V3(md) => {
                let extra = extra.ok_or_else(|| MdError::MissingKeyBundle("no extra metadata".to_string()))?;
                md.update_key_bundles(extra, updated_writer_keys, updated_reader_keys, ephemeral, crypt_keys)
            }
        }
    }

    pub fn revoke_removed_devices(
        &mut self,
        extra: Option<&mut ExtraMetadataV3>,
        updated_writer_keys: &UserDevicePublicKeys,
        updated_reader_keys: &UserDevicePublicKeys,
    ) -> Result<ServerHalfRemovalInfo, MdError> {
        self.check_comprehended()?;
        let removal = match self {
            RootMetadata::V2(md) => md.revoke_removed_devices(updated_writer_keys, updated_reader_keys),
            RootMetadata::V3(md) => {
                let extra = extra.ok_or_else(|| MdError::MissingKeyBundle("no extra metadata".to_string()))?;
                md.revoke_removed_devices(extra, updated_writer_keys, updated_reader_keys)
            }
        }?;
        if !removal.is_empty() {
            tracing::info!(
                "revoked devices of {} users from folder {}",
                removal.len(),
                self.tlf_id()
            );
        }
        Ok(removal)
    }

    pub fn promote_readers(
        &mut self,
        extra: Option<&mut ExtraMetadataV3>,
        readers: &BTreeSet<UserId>,
    ) -> Result<(), MdError> {
        self.check_comprehended()?;
        match self {
            RootMetadata::V2(md) => md.promote_readers(readers),
            RootMetadata::V3(md) => {
                let extra = extra.ok_or_else(|| MdError::MissingKeyBundle("no extra metadata".to_string()))?;
                md.promote_readers(extra, readers)
            }
        }
    }

    /// Whether this revision is a reader rekeying only its own devices on
    /// top of `prev`
    pub fn is_valid_rekey_request(
        &self,
        prev: &RootMetadata,
        user: &UserId,
        prev_extra: Option<&ExtraMetadataV3>,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<bool, MdError> {
        self.check_comprehended()?;
        match (self, prev) {
            (RootMetadata::V2(md), RootMetadata::V2(prev)) => md.is_valid_rekey_request(prev, user),
            (RootMetadata::V3(md), RootMetadata::V3(prev)) => {
                md.is_valid_rekey_request(prev, user, prev_extra, extra)
            }
            _ => Ok(false),
        }
    }

    /// An unsigned copy to build the next revision from.
    ///
    /// When this revision predates segregated key bundles, the caller can
    /// read and write it, and `latest_version` allows it, the copy is
    /// up-converted. `crypt_keys` must then hold every generation's key,
    /// oldest first.
    pub fn make_successor_copy(
        &self,
        curr_id: &MetadataId,
        extra: Option<&ExtraMetadataV3>,
        latest_version: MetadataVer,
        crypt_keys: &[TlfCryptKey],
        is_readable_and_writer: bool,
    ) -> Result<(RootMetadata, Option<ExtraMetadataV3>), MdError> {
        self.check_comprehended()?;
        if self.is_final() {
            return Err(MdError::MetadataIsFinal(self.revision()));
        }

        let (mut next, next_extra) = match self {
            RootMetadata::V2(md)
                if is_readable_and_writer && latest_version.has_segregated_key_bundles() =>
            {
                if latest_version > MetadataVer::LATEST {
                    return Err(MdError::UnsupportedVersion(latest_version));
                }
                let (v3, extra) = md.up_convert(latest_version, crypt_keys)?;
                tracing::debug!(
                    "up-converted folder {} from version {} to {}",
                    self.tlf_id(),
                    md.version,
                    latest_version
                );
                (RootMetadata::V3(v3), extra)
            }
            RootMetadata::V2(md) => (RootMetadata::V2(md.clone()), None),
            RootMetadata::V3(md) => {
                let extra = md.check_extra(extra)?.map(ExtraMetadataV3::successor_copy);
                (RootMetadata::V3(md.clone()), extra)
            }
        };

        next.set_prev_root(curr_id.clone());
        next.set_revision(
            self.revision()
                .checked_next()
                .ok_or(MdError::RevisionOverflow(self.revision()))?,
        );
        next.clear_flag(MetadataFlags::WRITER_METADATA_COPIED);
        with_md!(&mut next, md => {
            md.writer_metadata.ref_bytes = 0;
            md.writer_metadata.unref_bytes = 0;
            md.writer_metadata.md_ref_bytes = 0;
        });
        Ok((next, next_extra))
    }

    /// Take the writer metadata of `prev` verbatim and mark it copied, for
    /// revisions made by someone who may not write (reader rekeys)
    pub fn copy_writer_metadata_from(&mut self, prev: &RootMetadata) -> Result<(), MdError> {
        match (self, prev) {
            (RootMetadata::V2(md), RootMetadata::V2(prev)) => {
                md.writer_metadata = prev.writer_metadata.clone();
                md.flags.set(MetadataFlags::WRITER_METADATA_COPIED);
            }
            (RootMetadata::V3(md), RootMetadata::V3(prev)) => {
                md.writer_metadata = prev.writer_metadata.clone();
                md.flags.set(MetadataFlags::WRITER_METADATA_COPIED);
            }
            (md, prev) => {
                return Err(MdError::Invalid(format!(
                    "cannot copy writer metadata of version {} into version {}",
                    prev.version(),
                    md.version()
                )))
            }
        }
        Ok(())
    }

    /// Check that `next` may directly follow this revision, whose ID is
    /// `curr_id`
    pub fn check_valid_successor(&self, curr_id: &MetadataId, next: &RootMetadata) -> Result<(), MdError> {
        if self.is_final() {
            return Err(MdError::MetadataIsFinal(self.revision()));
        }

        if self.tlf_id() != next.tlf_id() {
            return Err(MdError::TlfIdMismatch {
                current: self.tlf_id(),
                next: next.tlf_id(),
            });
        }

        if self.revision().checked_next() != Some(next.revision()) {
            return Err(MdError::RevisionMismatch {
                current: self.revision(),
                next: next.revision(),
            });
        }

        // finalizing does not advance the hash pointer
        let expected_prev_root = if next.is_final() {
            self.prev_root()
        } else {
            curr_id
        };
        if next.prev_root() != expected_prev_root {
            return Err(MdError::PrevRootMismatch {
                expected: expected_prev_root.clone(),
                actual: next.prev_root().clone(),
            });
        }

        match (self.merged_status(), next.merged_status()) {
            (MergeStatus::Merged, MergeStatus::Unmerged) => return Err(MdError::UnmergedAfterMerged),
            (MergeStatus::Unmerged, MergeStatus::Merged) => {}
            _ if self.bid() != next.bid() => {
                return Err(MdError::BranchIdMismatch {
                    current: self.bid(),
                    next: next.bid(),
                })
            }
            _ => {}
        }

        if !next.is_writer_metadata_copied_set() {
            let expected = self.disk_usage() as i128 + next.ref_bytes() as i128
                - next.unref_bytes() as i128;
            if expected != next.disk_usage() as i128 {
                return Err(MdError::DiskUsageMismatch {
                    expected: expected.clamp(0, u64::MAX as i128) as u64,
                    actual: next.disk_usage(),
                });
            }
            let expected = self.md_disk_usage() as i128 + next.md_ref_bytes() as i128;
            if expected != next.md_disk_usage() as i128 {
                return Err(MdError::MdDiskUsageMismatch {
                    expected: expected.clamp(0, u64::MAX as i128) as u64,
                    actual: next.md_disk_usage(),
                });
            }
        }
        Ok(())
    }

    /// [`RootMetadata::check_valid_successor`] with failures expressed as
    /// the conflict codes a server reports
    pub fn check_valid_successor_for_server(
        &self,
        curr_id: &MetadataId,
        next: &RootMetadata,
    ) -> Result<(), ServerError> {
        self.check_valid_successor(curr_id, next)
            .map_err(ServerError::from)
    }

    /// Structural checks on a decoded revision. `extra` must accompany
    /// keyed V3 revisions.
    pub fn is_valid(&self, extra: Option<&ExtraMetadataV3>) -> Result<(), MdError> {
        if !self.version().is_valid() {
            return Err(MdError::Invalid(format!("metadata version {}", self.version())));
        }
        if self.tlf_id().is_zero() {
            return Err(MdError::Invalid("zero folder ID".to_string()));
        }
        if self.revision() < Revision::INITIAL {
            return Err(MdError::Invalid(format!("revision {}", self.revision())));
        }
        match self.merged_status() {
            MergeStatus::Merged if !self.bid().is_null() => {
                return Err(MdError::Invalid(format!(
                    "merged revision on branch {}",
                    self.bid()
                )))
            }
            MergeStatus::Unmerged if self.bid().is_null() => {
                return Err(MdError::Invalid("unmerged revision without a branch".to_string()))
            }
            _ => {}
        }
        if self.last_modifying_writer().is_zero() {
            return Err(MdError::Invalid("no last modifying writer".to_string()));
        }
        if self.last_modifying_user().is_zero() {
            return Err(MdError::Invalid("no last modifying user".to_string()));
        }

        let public = self.tlf_id().is_public();
        let key_gen = self.latest_key_generation();
        if public != (key_gen == KeyGen::PUBLIC) {
            return Err(MdError::Invalid(format!(
                "key generation {} for {} folder",
                key_gen,
                if public { "public" } else { "private" }
            )));
        }

        // newer layouts are carried verbatim
        if self.version() > MetadataVer::LATEST {
            return Ok(());
        }
        if let RootMetadata::V2(md) = self {
            md.check_generations()?;
        }
        let extra = self.check_extra(extra)?;
        if public || key_gen.is_valid() {
            let writer = self.last_modifying_writer();
            if !self.is_writer(&writer, None, extra) {
                return Err(MdError::Invalid(format!("{} is not a writer", writer)));
            }
            let user = self.last_modifying_user();
            if !self.is_reader(&user, None, extra) {
                return Err(MdError::Invalid(format!("{} is not a reader", user)));
            }
        }
        Ok(())
    }
}

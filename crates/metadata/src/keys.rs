//! Client-side key management for folders
//!
//! [`KeyManager`] is what the filesystem layer talks to. It resolves a
//! folder's crypt keys for the local device, creates folders, appends
//! revisions and rekeys folders when membership or devices change.
//!
//! # Rekeying
//!
//! A writer rekey either adds devices to the latest key generation, or,
//! when a device or user lost access, revokes them and starts a new
//! generation so the removed parties cannot read anything written later.
//! Readers cannot touch writer metadata; a reader whose device is not keyed
//! yet sets the rekey flag on a copied revision and waits for a writer.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::config::Config;
use crate::context::RequestContext;
use crate::crypto::{
    unmask, CryptPrivateKey, CryptPublicKey, CryptoError, SignatureInfo, SigningKey,
    TlfCryptKey, TlfCryptKeyServerHalfId, TlfEphemeralPrivateKey, TlfPrivateKey, VerifyingKey,
};
use crate::key_bundle_cache::KeyBundleCache;
use crate::md::{
    BranchId, ExtraMetadataV3, KeyGen, MdError, MergeStatus, MetadataFlags, MetadataVer,
    PrivateMetadata, RootMetadata, RootMetadataSigned, ServerHalfRemovalInfo,
    UserDevicePublicKeys, UserDeviceServerHalves,
};
use crate::merkle::{MerkleLeaf, MerkleTreeId, StoredMerkleLeaf};
use crate::server::{FolderLocks, KeyServer, MdServer, MerkleService, ServerError};
use crate::tlf::{TlfHandle, TlfId, TlfType, UserId};

/// The keys of the device this client runs on
#[derive(Debug, Clone)]
pub struct LocalDevice {
    pub uid: UserId,
    pub signing_key: SigningKey,
    pub crypt_key: CryptPrivateKey,
}

impl LocalDevice {
    /// A new device for a new user
    pub fn generate() -> Self {
        Self::for_user(UserId::generate())
    }

    /// A new device for an existing user
    pub fn for_user(uid: UserId) -> Self {
        LocalDevice {
            uid,
            signing_key: SigningKey::generate(),
            crypt_key: CryptPrivateKey::generate(),
        }
    }

    pub fn crypt_public_key(&self) -> CryptPublicKey {
        self.crypt_key.public()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyManagerError {
    #[error("key manager error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("metadata error: {0}")]
    Md(#[from] MdError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("server error: {0}")]
    Server(#[from] ServerError),
    #[error("folder {0} not found")]
    FolderNotFound(TlfId),
    #[error("{0} is not a member of folder {1}")]
    NotMember(UserId, TlfId),
    #[error("{0} cannot write folder {1}")]
    NotWriter(UserId, TlfId),
    #[error("no merkle service configured")]
    NoMerkleService,
}

impl KeyManagerError {
    /// Whether re-fetching the head and trying again can succeed
    pub fn is_conflict(&self) -> bool {
        match self {
            KeyManagerError::Md(e) => e.is_conflict(),
            KeyManagerError::Server(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// A verified merged head and the key bundles it references
#[derive(Debug, Clone, PartialEq)]
pub struct FolderHead {
    pub rmds: RootMetadataSigned,
    pub extra: Option<ExtraMetadataV3>,
}

impl FolderHead {
    pub fn md(&self) -> &RootMetadata {
        self.rmds.md()
    }

    pub fn tlf_id(&self) -> TlfId {
        self.rmds.md().tlf_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyOutcome {
    /// Every wanted device already had the latest key
    Unchanged,
    /// New devices were keyed for the existing generations
    Updated,
    /// Something was revoked and a new generation started
    NewGeneration(KeyGen),
    /// This reader device has no key; the rekey flag asks a writer for one
    RequestedRekey,
}

/// Whether some user or device in `current` is absent from `wanted`
fn has_removals(current: &UserDevicePublicKeys, wanted: &UserDevicePublicKeys) -> bool {
    current.iter().any(|(uid, devices)| match wanted.get(uid) {
        Some(kept) => !devices.is_subset(kept),
        None => true,
    })
}

/// Whether `wanted` names a user or device `current` lacks
fn has_additions(current: &UserDevicePublicKeys, wanted: &UserDevicePublicKeys) -> bool {
    wanted.iter().any(|(uid, devices)| match current.get(uid) {
        Some(have) => !devices.is_subset(have),
        None => true,
    })
}

fn union(a: &UserDevicePublicKeys, b: &UserDevicePublicKeys) -> UserDevicePublicKeys {
    let mut all = a.clone();
    for (uid, devices) in b {
        all.entry(*uid).or_default().extend(devices.iter().copied());
    }
    all
}

/// A revoked device's server half that the key server still holds because
/// deleting it failed after the revision was committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHalfDeletion {
    pub uid: UserId,
    pub device: CryptPublicKey,
    pub id: TlfCryptKeyServerHalfId,
}

#[derive(Debug, Clone)]
pub struct KeyManager {
    device: Arc<LocalDevice>,
    md_server: Arc<dyn MdServer>,
    key_server: Arc<dyn KeyServer>,
    merkle: Option<Arc<dyn MerkleService>>,
    cache: Arc<KeyBundleCache>,
    locks: FolderLocks,
    pending_deletions: Arc<Mutex<Vec<PendingHalfDeletion>>>,
    metadata_version: MetadataVer,
    min_metadata_version: MetadataVer,
}

impl KeyManager {
    pub fn new(
        device: LocalDevice,
        md_server: Arc<dyn MdServer>,
        key_server: Arc<dyn KeyServer>,
        config: &Config,
    ) -> Self {
        KeyManager {
            device: Arc::new(device),
            md_server,
            key_server,
            merkle: None,
            cache: Arc::new(config.key_bundle_cache()),
            locks: FolderLocks::new(),
            pending_deletions: Arc::default(),
            metadata_version: config.metadata_version,
            min_metadata_version: config.min_metadata_version,
        }
    }

    /// Anchor every published revision with `merkle`
    pub fn with_merkle(mut self, merkle: Arc<dyn MerkleService>) -> Self {
        self.merkle = Some(merkle);
        self
    }

    pub fn device(&self) -> &LocalDevice {
        &self.device
    }

    pub fn cache(&self) -> &KeyBundleCache {
        &self.cache
    }

    /// Server halves of revoked devices still waiting to be deleted
    pub fn pending_half_deletions(&self) -> Vec<PendingHalfDeletion> {
        self.pending_deletions.lock().clone()
    }

    /// Try again to delete the halves a previous publish could not.
    /// Returns how many are still pending.
    pub async fn retry_half_deletions(&self, ctx: &RequestContext) -> usize {
        let pending = std::mem::take(&mut *self.pending_deletions.lock());
        for deletion in pending {
            self.delete_half(ctx, deletion).await;
        }
        self.pending_deletions.lock().len()
    }

    /// Delete one revoked half, queueing it for a retry on failure
    async fn delete_half(&self, ctx: &RequestContext, deletion: PendingHalfDeletion) {
        match self
            .key_server
            .delete_server_half(ctx, &deletion.uid, &deletion.device, &deletion.id)
            .await
        {
            Ok(()) | Err(ServerError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(
                    trace_id = %ctx.trace_id(),
                    "failed to delete server half of revoked device {} of {}: {}",
                    deletion.device,
                    deletion.uid,
                    e
                );
                self.pending_deletions.lock().push(deletion);
            }
        }
    }

    /// The bundles a V3 revision references, from the cache or the server
    pub async fn get_extra(
        &self,
        ctx: &RequestContext,
        md: &RootMetadata,
    ) -> Result<Option<ExtraMetadataV3>, KeyManagerError> {
        let Some((wkb_id, rkb_id)) = md.key_bundle_ids() else {
            return Ok(None);
        };
        let tlf = md.tlf_id();
        if let Some(extra) = self.cache.get_extra(tlf, &wkb_id, &rkb_id) {
            return Ok(Some(extra));
        }
        let extra = self
            .md_server
            .get_key_bundles(ctx, tlf, &wkb_id, &rkb_id)
            .await?;
        md.check_extra(Some(&extra))?;
        self.cache.put_extra(tlf, &extra)?;
        Ok(Some(extra))
    }

    /// Fetch and verify the merged head of `tlf`
    pub async fn head(&self, ctx: &RequestContext, tlf: TlfId) -> Result<FolderHead, KeyManagerError> {
        let rmds = self
            .md_server
            .get_for_tlf(ctx, tlf, BranchId::NULL, MergeStatus::Merged)
            .await?
            .ok_or(KeyManagerError::FolderNotFound(tlf))?;
        if rmds.version() < self.min_metadata_version {
            return Err(MdError::VersionTooOld {
                version: rmds.version(),
                min: self.min_metadata_version,
            }
            .into());
        }
        let extra = self.get_extra(ctx, rmds.md()).await?;
        rmds.is_valid_and_signed(extra.as_ref())?;
        Ok(FolderHead { rmds, extra })
    }

    /// Recover one generation's key from this device's halves
    async fn device_crypt_key(
        &self,
        ctx: &RequestContext,
        md: &RootMetadata,
        extra: Option<&ExtraMetadataV3>,
        key_gen: KeyGen,
    ) -> Result<TlfCryptKey, KeyManagerError> {
        let uid = self.device.uid;
        let device = self.device.crypt_public_key();
        let (info, ephemeral) = md.key_info_for_device(key_gen, &uid, &device, extra)?;
        let client_half = info.client_half.open(&self.device.crypt_key, &ephemeral)?;
        let server_half = self
            .key_server
            .get_server_half(ctx, &info.server_half_id, &device)
            .await?;
        info.server_half_id.verify(&uid, &device, &server_half)?;
        Ok(unmask(&server_half, &client_half))
    }

    async fn crypt_key_at(
        &self,
        ctx: &RequestContext,
        md: &RootMetadata,
        extra: Option<&ExtraMetadataV3>,
        key_gen: KeyGen,
    ) -> Result<TlfCryptKey, KeyManagerError> {
        if md.tlf_id().is_public() {
            return Err(MdError::PublicFolder.into());
        }
        let latest = md.latest_key_generation();
        if !key_gen.is_valid() || key_gen > latest {
            return Err(MdError::InvalidKeyGeneration { key_gen, latest }.into());
        }
        match md {
            // older V3 generations live only in the historic key list
            RootMetadata::V3(_) if key_gen < latest => {
                let current = self.device_crypt_key(ctx, md, extra, latest).await?;
                let extra = extra.ok_or_else(|| {
                    MdError::MissingKeyBundle(format!("bundles of folder {}", md.tlf_id()))
                })?;
                let historic = extra.historic_crypt_keys(&current)?;
                let index = key_gen.index().unwrap_or_default();
                historic.get(index).copied().ok_or_else(|| {
                    MdError::KeyCountMismatch {
                        expected: index + 1,
                        actual: historic.len(),
                    }
                    .into()
                })
            }
            _ => self.device_crypt_key(ctx, md, extra, key_gen).await,
        }
    }

    /// Every generation's key, oldest first
    async fn all_crypt_keys(
        &self,
        ctx: &RequestContext,
        md: &RootMetadata,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<Vec<TlfCryptKey>, KeyManagerError> {
        let latest = md.latest_key_generation();
        if !latest.is_valid() {
            return Ok(Vec::new());
        }
        match md {
            RootMetadata::V3(_) => {
                let current = self.device_crypt_key(ctx, md, extra, latest).await?;
                let extra = extra.ok_or_else(|| {
                    MdError::MissingKeyBundle(format!("bundles of folder {}", md.tlf_id()))
                })?;
                let mut keys = extra.historic_crypt_keys(&current)?;
                keys.push(current);
                Ok(keys)
            }
            RootMetadata::V2(_) => {
                let mut keys = Vec::new();
                for key_gen in KeyGen::FIRST_VALID.value()..=latest.value() {
                    keys.push(
                        self.device_crypt_key(ctx, md, extra, KeyGen::new(key_gen))
                            .await?,
                    );
                }
                Ok(keys)
            }
        }
    }

    /// The keys `update_key_bundles` expects for `md`'s representation
    fn keys_for_update(md: &RootMetadata, all: &[TlfCryptKey]) -> Vec<TlfCryptKey> {
        match md {
            RootMetadata::V3(_) => all.last().copied().into_iter().collect(),
            RootMetadata::V2(_) => all.to_vec(),
        }
    }

    /// Plaintext crypt key of generation `key_gen` of the folder at `head`
    pub async fn get_tlf_crypt_key(
        &self,
        ctx: &RequestContext,
        head: &FolderHead,
        key_gen: KeyGen,
    ) -> Result<TlfCryptKey, KeyManagerError> {
        self.crypt_key_at(ctx, head.md(), head.extra.as_ref(), key_gen)
            .await
    }

    /// Every generation's crypt key, oldest first
    pub async fn get_all_crypt_keys(
        &self,
        ctx: &RequestContext,
        head: &FolderHead,
    ) -> Result<Vec<TlfCryptKey>, KeyManagerError> {
        self.all_crypt_keys(ctx, head.md(), head.extra.as_ref()).await
    }

    pub async fn private_metadata(
        &self,
        ctx: &RequestContext,
        head: &FolderHead,
    ) -> Result<PrivateMetadata, KeyManagerError> {
        let md = head.md();
        if md.tlf_id().is_public() {
            return Ok(md.private_metadata(None)?);
        }
        let key = self
            .crypt_key_at(ctx, md, head.extra.as_ref(), md.latest_key_generation())
            .await?;
        Ok(md.private_metadata(Some(&key))?)
    }

    /// Create a folder whose first revision keys every listed device.
    /// This device's user must be among `writers`.
    pub async fn create_folder(
        &self,
        ctx: &RequestContext,
        tlf_type: TlfType,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
    ) -> Result<FolderHead, KeyManagerError> {
        let tlf = TlfId::generate(tlf_type);
        let uid = self.device.uid;
        if !writers.contains_key(&uid) {
            return Err(KeyManagerError::NotWriter(uid, tlf));
        }
        let handle = TlfHandle::new(
            writers.keys().copied().collect(),
            readers.keys().copied().collect(),
        );
        let mut md = RootMetadata::make_initial(self.metadata_version, tlf, &handle)?;

        let mut pmd = PrivateMetadata::default();
        let mut extra = None;
        let mut halves = Vec::new();
        let crypt_key = match tlf_type {
            TlfType::Public => None,
            TlfType::Private => {
                let crypt_key = TlfCryptKey::generate();
                let tlf_key = TlfPrivateKey::generate();
                let (new_extra, new_halves) = md.add_key_generation(
                    None,
                    None,
                    writers,
                    readers,
                    &TlfEphemeralPrivateKey::generate(),
                    tlf_key.public(),
                    &crypt_key,
                )?;
                pmd.tlf_private_key = Some(tlf_key);
                extra = new_extra;
                halves.push(new_halves);
                Some(crypt_key)
            }
        };
        md.set_private_metadata(&pmd, crypt_key.as_ref())?;

        let _guard = self.locks.lock(tlf).await;
        let head = self
            .publish(ctx, md, extra, halves, ServerHalfRemovalInfo::default(), None)
            .await?;
        tracing::info!("created {} folder {}", tlf_type, tlf);
        Ok(head)
    }

    /// Append a revision made by `update` on top of the merged head.
    ///
    /// The successor is up-converted to the configured version when the
    /// head predates it.
    pub async fn commit<F>(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        update: F,
    ) -> Result<FolderHead, KeyManagerError>
    where
        F: FnOnce(&mut RootMetadata) -> Result<(), MdError> + Send,
    {
        let _guard = self.locks.lock(tlf).await;
        let head = self.head(ctx, tlf).await?;
        let md = head.md();
        let uid = self.device.uid;
        if !md.is_writer(&uid, None, head.extra.as_ref()) {
            return Err(KeyManagerError::NotWriter(uid, tlf));
        }
        let crypt_keys = self.all_crypt_keys(ctx, md, head.extra.as_ref()).await?;
        let (mut next, extra) = md.make_successor_copy(
            &head.rmds.md_id()?,
            head.extra.as_ref(),
            self.metadata_version,
            &crypt_keys,
            true,
        )?;
        update(&mut next)?;
        self.publish(ctx, next, extra, Vec::new(), ServerHalfRemovalInfo::default(), None)
            .await
    }

    /// Bring the folder's keys in line with the wanted writer and reader
    /// devices
    pub async fn rekey(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
    ) -> Result<RekeyOutcome, KeyManagerError> {
        if tlf.is_public() {
            return Ok(RekeyOutcome::Unchanged);
        }
        let _guard = self.locks.lock(tlf).await;
        let head = self.head(ctx, tlf).await?;
        let uid = self.device.uid;
        let extra = head.extra.as_ref();
        if head.md().is_writer(&uid, None, extra) {
            self.rekey_as_writer(ctx, &head, writers, readers).await
        } else if head.md().is_reader(&uid, None, extra) {
            self.rekey_as_reader(ctx, &head, readers).await
        } else {
            Err(KeyManagerError::NotMember(uid, tlf))
        }
    }

    async fn rekey_as_writer(
        &self,
        ctx: &RequestContext,
        head: &FolderHead,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
    ) -> Result<RekeyOutcome, KeyManagerError> {
        let md = head.md();
        let crypt_keys = self.all_crypt_keys(ctx, md, head.extra.as_ref()).await?;
        let (mut next, mut extra) = md.make_successor_copy(
            &head.rmds.md_id()?,
            head.extra.as_ref(),
            self.metadata_version,
            &crypt_keys,
            true,
        )?;
        let (current_writers, current_readers) = next.user_device_public_keys(extra.as_ref());

        let mut halves = Vec::new();
        let mut removal = ServerHalfRemovalInfo::default();
        let outcome = if has_removals(&current_writers, writers)
            || has_removals(&current_readers, &union(writers, readers))
        {
            removal = next.revoke_removed_devices(extra.as_mut(), writers, readers)?;
            let prev_key = crypt_keys.last().copied();
            let crypt_key = TlfCryptKey::generate();
            let tlf_key = TlfPrivateKey::generate();
            let (new_extra, new_halves) = next.add_key_generation(
                extra.as_ref(),
                prev_key.as_ref(),
                writers,
                readers,
                &TlfEphemeralPrivateKey::generate(),
                tlf_key.public(),
                &crypt_key,
            )?;
            halves.push(new_halves);
            if new_extra.is_some() {
                extra = new_extra;
            }

            // private metadata moves to the new generation's key
            let mut pmd = next.private_metadata(prev_key.as_ref())?;
            pmd.tlf_private_key = Some(tlf_key);
            next.set_private_metadata(&pmd, Some(&crypt_key))?;
            RekeyOutcome::NewGeneration(next.latest_key_generation())
        } else {
            let promoted: BTreeSet<UserId> = current_readers
                .keys()
                .filter(|uid| writers.contains_key(uid))
                .copied()
                .collect();
            if !promoted.is_empty() {
                next.promote_readers(extra.as_mut(), &promoted)?;
            }
            let (current_writers, current_readers) = next.user_device_public_keys(extra.as_ref());
            let additions = has_additions(&current_writers, writers)
                || has_additions(&current_readers, readers);
            if !additions && promoted.is_empty() && !md.is_rekey_set() {
                return Ok(RekeyOutcome::Unchanged);
            }
            if additions {
                halves = next.update_key_bundles(
                    extra.as_mut(),
                    writers,
                    readers,
                    &TlfEphemeralPrivateKey::generate(),
                    &Self::keys_for_update(&next, &crypt_keys),
                )?;
            }
            RekeyOutcome::Updated
        };

        next.clear_flag(MetadataFlags::REKEY);
        self.publish(ctx, next, extra, halves, removal, None).await?;
        tracing::info!("rekeyed folder {}: {:?}", head.tlf_id(), outcome);
        Ok(outcome)
    }

    async fn rekey_as_reader(
        &self,
        ctx: &RequestContext,
        head: &FolderHead,
        readers: &UserDevicePublicKeys,
    ) -> Result<RekeyOutcome, KeyManagerError> {
        let md = head.md();
        let uid = self.device.uid;
        let (mut next, mut extra) = md.make_successor_copy(
            &head.rmds.md_id()?,
            head.extra.as_ref(),
            md.version(),
            &[],
            false,
        )?;
        next.copy_writer_metadata_from(md)?;
        let prev_writer_sig = Some(head.rmds.writer_sig_info());

        let crypt_keys = match self.all_crypt_keys(ctx, md, head.extra.as_ref()).await {
            Ok(keys) => keys,
            Err(KeyManagerError::Md(MdError::MissingKeyInfo { .. })) => {
                if md.is_rekey_set() {
                    return Ok(RekeyOutcome::RequestedRekey);
                }
                next.set_flag(MetadataFlags::REKEY);
                self.publish_copied(ctx, next, extra, Vec::new(), prev_writer_sig)
                    .await?;
                tracing::info!("requested rekey of folder {}", head.tlf_id());
                return Ok(RekeyOutcome::RequestedRekey);
            }
            Err(e) => return Err(e),
        };

        // a reader may only key its own devices
        let (_, current_readers) = md.user_device_public_keys(head.extra.as_ref());
        let mine: UserDevicePublicKeys = readers
            .get(&uid)
            .map(|devices| (uid, devices.clone()))
            .into_iter()
            .collect();
        if !has_additions(&current_readers, &mine) {
            return Ok(RekeyOutcome::Unchanged);
        }
        let halves = next.update_key_bundles(
            extra.as_mut(),
            &UserDevicePublicKeys::new(),
            &mine,
            &TlfEphemeralPrivateKey::generate(),
            &Self::keys_for_update(&next, &crypt_keys),
        )?;
        self.publish_copied(ctx, next, extra, halves, prev_writer_sig)
            .await?;
        Ok(RekeyOutcome::Updated)
    }

    async fn publish_copied(
        &self,
        ctx: &RequestContext,
        md: RootMetadata,
        extra: Option<ExtraMetadataV3>,
        halves: Vec<UserDeviceServerHalves>,
        prev_writer_sig: Option<&SignatureInfo>,
    ) -> Result<FolderHead, KeyManagerError> {
        self.publish(ctx, md, extra, halves, ServerHalfRemovalInfo::default(), prev_writer_sig)
            .await
    }

    /// Push new server halves, sign and put the revision, then delete
    /// revoked halves and anchor the result
    async fn publish(
        &self,
        ctx: &RequestContext,
        mut md: RootMetadata,
        extra: Option<ExtraMetadataV3>,
        halves: Vec<UserDeviceServerHalves>,
        removal: ServerHalfRemovalInfo,
        prev_writer_sig: Option<&SignatureInfo>,
    ) -> Result<FolderHead, KeyManagerError> {
        let uid = self.device.uid;
        md.set_last_modifying_user(uid);
        if !md.is_writer_metadata_copied_set() {
            md.set_last_modifying_writer(uid);
        }

        // halves first, so a key is never referenced before it can be fetched
        for batch in halves.iter().filter(|batch| !batch.is_empty()) {
            self.key_server.put_server_halves(ctx, batch).await?;
        }
        let rmds = RootMetadataSigned::sign(md, &self.device.signing_key, prev_writer_sig)?;
        self.md_server.put(ctx, &rmds, extra.as_ref()).await?;

        // the revision is committed; nothing below may fail the publish
        for (removed, device, id) in removal.server_half_ids() {
            let deletion = PendingHalfDeletion {
                uid: *removed,
                device: *device,
                id: id.clone(),
            };
            self.delete_half(ctx, deletion).await;
        }

        let tlf = rmds.md().tlf_id();
        if let Some(extra) = &extra {
            if let Err(e) = self.cache.put_extra(tlf, extra) {
                tracing::warn!(
                    trace_id = %ctx.trace_id(),
                    "failed to cache key bundles of folder {}: {}",
                    tlf,
                    e
                );
            }
        }
        if let Some(merkle) = &self.merkle {
            if let Err(e) = self.anchor(ctx, merkle.as_ref(), &rmds, extra.as_ref()).await {
                tracing::warn!(
                    trace_id = %ctx.trace_id(),
                    "failed to anchor revision {} of folder {}: {}",
                    rmds.md().revision(),
                    tlf,
                    e
                );
            }
        }
        tracing::debug!("published revision {} of folder {}", rmds.md().revision(), tlf);
        Ok(FolderHead { rmds, extra })
    }

    async fn anchor(
        &self,
        ctx: &RequestContext,
        merkle: &dyn MerkleService,
        rmds: &RootMetadataSigned,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<(), KeyManagerError> {
        let md = rmds.md();
        let leaf = MerkleLeaf::for_signed(rmds, OffsetDateTime::now_utc())?;
        let stored = if md.tlf_id().is_public() {
            StoredMerkleLeaf::Plain(leaf)
        } else {
            let key_gen = md.latest_key_generation();
            let tlf_public_key = md.tlf_public_key(extra).ok_or(MdError::InvalidKeyGeneration {
                key_gen,
                latest: key_gen,
            })?;
            StoredMerkleLeaf::Encrypted(leaf.encrypt(
                key_gen,
                &tlf_public_key,
                &TlfEphemeralPrivateKey::generate(),
            )?)
        };
        let root = merkle.submit_leaf(ctx, md.tlf_id(), stored).await?;
        tracing::debug!(
            "anchored revision {} of folder {} at seqno {}",
            md.revision(),
            md.tlf_id(),
            root.seqno
        );
        Ok(())
    }

    /// Whether the Merkle tree's leaf for the folder anchors `head`
    pub async fn verify_anchor(
        &self,
        ctx: &RequestContext,
        head: &FolderHead,
    ) -> Result<bool, KeyManagerError> {
        let merkle = self.merkle.as_ref().ok_or(KeyManagerError::NoMerkleService)?;
        let md = head.md();
        let tree_id = if md.tlf_id().is_public() {
            MerkleTreeId::PUBLIC
        } else {
            MerkleTreeId::PRIVATE
        };
        let Some((stored, _)) = merkle.get_leaf(ctx, tree_id, md.tlf_id()).await? else {
            return Ok(false);
        };
        let leaf = match stored {
            StoredMerkleLeaf::Plain(leaf) => leaf,
            // sealed under another generation, so it anchors another revision
            StoredMerkleLeaf::Encrypted(sealed) if sealed.key_gen != md.latest_key_generation() => {
                return Ok(false)
            }
            StoredMerkleLeaf::Encrypted(sealed) => {
                let pmd = self.private_metadata(ctx, head).await?;
                let tlf_key = pmd.tlf_private_key.ok_or_else(|| {
                    MdError::Invalid(format!("folder {} has no TLF private key", md.tlf_id()))
                })?;
                sealed.decrypt(&tlf_key)?
            }
        };
        Ok(leaf.matches(&head.rmds)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testkit::{device_keys, TestEnv};

    #[tokio::test]
    async fn test_create_and_resolve_keys() {
        let env = TestEnv::new();
        let alice = env.client();
        let ctx = RequestContext::new();
        let writers = device_keys(&[alice.device()]);
        let head = alice
            .create_folder(&ctx, TlfType::Private, &writers, &UserDevicePublicKeys::new())
            .await
            .unwrap();
        assert_eq!(head.md().latest_key_generation(), KeyGen::FIRST_VALID);

        let key = alice
            .get_tlf_crypt_key(&ctx, &head, KeyGen::FIRST_VALID)
            .await
            .unwrap();
        let pmd = head.md().private_metadata(Some(&key)).unwrap();
        assert!(pmd.tlf_private_key.is_some());
        assert!(matches!(
            alice.get_tlf_crypt_key(&ctx, &head, KeyGen::new(2)).await,
            Err(KeyManagerError::Md(MdError::InvalidKeyGeneration { .. }))
        ));
    }

    #[tokio::test]
    async fn test_creator_must_write() {
        let env = TestEnv::new();
        let alice = env.client();
        let bob = env.client();
        let err = alice
            .create_folder(
                &RequestContext::new(),
                TlfType::Private,
                &device_keys(&[bob.device()]),
                &UserDevicePublicKeys::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeyManagerError::NotWriter(..)));
    }

    #[tokio::test]
    async fn test_nothing_to_rekey() {
        let env = TestEnv::new();
        let alice = env.client();
        let ctx = RequestContext::new();
        let writers = device_keys(&[alice.device()]);
        let head = alice
            .create_folder(&ctx, TlfType::Private, &writers, &UserDevicePublicKeys::new())
            .await
            .unwrap();
        let outcome = alice
            .rekey(&ctx, head.tlf_id(), &writers, &UserDevicePublicKeys::new())
            .await
            .unwrap();
        assert_eq!(outcome, RekeyOutcome::Unchanged);
    }

    /// Passes everything through, except deletes while `fail_deletes` is set
    #[derive(Debug)]
    struct FlakyKeyServer {
        inner: Arc<crate::server::MemoryKeyServer>,
        fail_deletes: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyServer for FlakyKeyServer {
        async fn get_server_half(
            &self,
            ctx: &RequestContext,
            id: &TlfCryptKeyServerHalfId,
            device: &CryptPublicKey,
        ) -> Result<crate::crypto::TlfCryptKeyServerHalf, ServerError> {
            self.inner.get_server_half(ctx, id, device).await
        }

        async fn put_server_halves(
            &self,
            ctx: &RequestContext,
            halves: &UserDeviceServerHalves,
        ) -> Result<(), ServerError> {
            self.inner.put_server_halves(ctx, halves).await
        }

        async fn delete_server_half(
            &self,
            ctx: &RequestContext,
            uid: &UserId,
            device: &CryptPublicKey,
            id: &TlfCryptKeyServerHalfId,
        ) -> Result<(), ServerError> {
            if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ServerError::Throttle { retry_after_secs: 1 });
            }
            self.inner.delete_server_half(ctx, uid, device, id).await
        }
    }

    /// Collects formatted log lines for inspection
    #[derive(Debug, Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_failed_half_deletion_is_retried() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let env = TestEnv::new();
        let bob = env.client();
        let ctx = RequestContext::new();
        let flaky = Arc::new(FlakyKeyServer {
            inner: env.key_server.clone(),
            fail_deletes: std::sync::atomic::AtomicBool::new(true),
        });
        let alice = KeyManager::new(
            LocalDevice::generate(),
            env.md_server.clone(),
            flaky.clone(),
            env.config(),
        );
        let writers = device_keys(&[alice.device()]);
        let head = alice
            .create_folder(&ctx, TlfType::Private, &writers, &device_keys(&[bob.device()]))
            .await
            .unwrap();
        let bob_device = bob.device().crypt_public_key();
        let (info, _) = head
            .md()
            .key_info_for_device(KeyGen::FIRST_VALID, &bob.uid(), &bob_device, head.extra.as_ref())
            .unwrap();

        // the revocation commits even though the half survives
        let outcome = alice
            .rekey(&ctx, head.tlf_id(), &writers, &UserDevicePublicKeys::new())
            .await
            .unwrap();
        assert_eq!(outcome, RekeyOutcome::NewGeneration(KeyGen::new(2)));
        assert_eq!(
            alice.head(&ctx, head.tlf_id()).await.unwrap().md().latest_key_generation(),
            KeyGen::new(2)
        );
        let pending = alice.pending_half_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uid, bob.uid());
        assert_eq!(pending[0].id, info.server_half_id);
        assert_eq!(alice.retry_half_deletions(&ctx).await, 1);

        // post-commit warnings name the request they belong to
        let logs = logs.contents();
        assert!(logs.contains("failed to delete server half"));
        assert!(logs.contains(&ctx.trace_id().to_string()));

        flaky.fail_deletes.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(alice.retry_half_deletions(&ctx).await, 0);
        assert!(alice.pending_half_deletions().is_empty());
        assert!(matches!(
            env.key_server
                .get_server_half(&ctx, &info.server_half_id, &bob_device)
                .await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[test]
    fn test_membership_diffs() {
        let uid = UserId::generate();
        let a = CryptPrivateKey::generate().public();
        let b = CryptPrivateKey::generate().public();
        let one = UserDevicePublicKeys::from([(uid, BTreeSet::from([a]))]);
        let two = UserDevicePublicKeys::from([(uid, BTreeSet::from([a, b]))]);
        assert!(has_additions(&one, &two));
        assert!(!has_additions(&two, &one));
        assert!(has_removals(&two, &one));
        assert!(!has_removals(&one, &two));
        assert!(has_removals(&one, &UserDevicePublicKeys::new()));
        assert_eq!(union(&one, &two), two);
    }
}

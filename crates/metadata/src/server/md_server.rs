use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::Instrument;

use crate::context::RequestContext;
use crate::md::{
    BranchId, ExtraMetadataV3, MergeStatus, MetadataVer, ReaderKeyBundleV3, Revision,
    RootMetadata, RootMetadataSigned, TlfReaderKeyBundleId, TlfWriterKeyBundleId,
    WriterKeyBundleV3,
};
use crate::tlf::TlfId;

use super::errors::ServerError;
use super::locks::FolderLocks;

#[async_trait]
pub trait MdServer: Send + Sync + std::fmt::Debug + 'static {
    /// Append a signed revision to its folder's branch
    ///
    /// # Arguments
    /// * `rmds` - The signed revision
    /// * `extra` - Key bundles of a V3 revision. Bundles the server already
    ///   holds may be omitted.
    ///
    /// Should fail with a conflict error when `rmds` is not a valid
    ///  successor of the branch head, and with `WriteAccess` when the
    ///  last modifying user may not write the folder
    async fn put(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<(), ServerError>;

    /// The latest revision of a branch, if the folder has one.
    /// `bid` must be null for the merged branch.
    async fn get_for_tlf(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>, ServerError>;

    /// Revisions `start..=stop` of a branch, oldest first. Revisions past
    /// the head are simply absent.
    async fn get_range(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
    ) -> Result<Vec<RootMetadataSigned>, ServerError>;

    async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        wkb_id: &TlfWriterKeyBundleId,
        rkb_id: &TlfReaderKeyBundleId,
    ) -> Result<ExtraMetadataV3, ServerError>;
}

fn branch_for(bid: BranchId, status: MergeStatus) -> Result<BranchId, ServerError> {
    match status {
        MergeStatus::Merged if !bid.is_null() => Err(ServerError::BadRequest(format!(
            "merged lookup with branch {}",
            bid
        ))),
        MergeStatus::Unmerged if bid.is_null() => Err(ServerError::BadRequest(
            "unmerged lookup without a branch".to_string(),
        )),
        _ => Ok(bid),
    }
}

/// A user who is neither a writer of `prev` nor a reader making a valid
/// self-rekey may not append to it
fn check_write_access(
    prev: &RootMetadata,
    prev_extra: Option<&ExtraMetadataV3>,
    next: &RootMetadata,
    extra: Option<&ExtraMetadataV3>,
) -> Result<(), ServerError> {
    let user = next.last_modifying_user();
    if prev.is_writer(&user, None, prev_extra) {
        return Ok(());
    }
    if prev.is_reader(&user, None, prev_extra)
        && next.is_valid_rekey_request(prev, &user, prev_extra, extra)?
    {
        return Ok(());
    }
    Err(ServerError::WriteAccess(format!(
        "{} cannot write folder {}",
        user,
        next.tlf_id()
    )))
}

/// In-memory metadata server
#[derive(Debug, Clone, Default)]
pub struct MemoryMdServer {
    inner: Arc<RwLock<MemoryMdServerInner>>,
    locks: FolderLocks,
    folder_limit: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryMdServerInner {
    /// folder -> branch -> revision -> encoded envelope
    folders: HashMap<TlfId, HashMap<BranchId, BTreeMap<Revision, Vec<u8>>>>,
    writer_bundles: HashMap<(TlfId, TlfWriterKeyBundleId), WriterKeyBundleV3>,
    reader_bundles: HashMap<(TlfId, TlfReaderKeyBundleId), ReaderKeyBundleV3>,
}

fn decode(encoded: &[u8]) -> Result<RootMetadataSigned, ServerError> {
    Ok(RootMetadataSigned::decode(encoded, MetadataVer::FIRST_VALID)?)
}

impl MemoryMdServerInner {
    fn branch(&self, tlf: TlfId, bid: BranchId) -> Option<&BTreeMap<Revision, Vec<u8>>> {
        self.folders.get(&tlf).and_then(|branches| branches.get(&bid))
    }

    fn head(&self, tlf: TlfId, bid: BranchId) -> Result<Option<RootMetadataSigned>, ServerError> {
        self.branch(tlf, bid)
            .and_then(|revisions| revisions.values().next_back())
            .map(|encoded| decode(encoded))
            .transpose()
    }

    fn at(&self, tlf: TlfId, bid: BranchId, revision: Revision) -> Result<Option<RootMetadataSigned>, ServerError> {
        self.branch(tlf, bid)
            .and_then(|revisions| revisions.get(&revision))
            .map(|encoded| decode(encoded))
            .transpose()
    }

    /// `supplied`, or the stored bundles `md` references
    fn extra_for(
        &self,
        tlf: TlfId,
        md: &RootMetadata,
        supplied: Option<&ExtraMetadataV3>,
    ) -> Option<ExtraMetadataV3> {
        if let Some(extra) = supplied {
            return Some(extra.clone());
        }
        let (wkb_id, rkb_id) = md.key_bundle_ids()?;
        let wkb = self.writer_bundles.get(&(tlf, wkb_id))?;
        let rkb = self.reader_bundles.get(&(tlf, rkb_id))?;
        Some(ExtraMetadataV3::new(wkb.clone(), rkb.clone(), false, false))
    }
}

impl MemoryMdServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create more than `limit` folders
    pub fn with_folder_limit(mut self, limit: usize) -> Self {
        self.folder_limit = Some(limit);
        self
    }

    async fn put_locked(
        &self,
        rmds: &RootMetadataSigned,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<(), ServerError> {
        let md = rmds.md();
        let tlf = md.tlf_id();
        let bid = md.bid();
        let _guard = self.locks.lock(tlf).await;

        let extra = self.inner.read().extra_for(tlf, md, extra);
        rmds.is_valid_and_signed(extra.as_ref())?;

        let mut inner = self.inner.write();
        match (inner.head(tlf, bid)?, bid.is_null()) {
            (Some(head), _) => {
                let head_id = head.md_id()?;
                head.md().check_valid_successor_for_server(&head_id, md)?;
                let head_extra = inner.extra_for(tlf, head.md(), None);
                check_write_access(head.md(), head_extra.as_ref(), md, extra.as_ref())?;
            }
            (None, true) => {
                if md.revision() != Revision::INITIAL {
                    return Err(ServerError::ConflictRevision {
                        expected: Revision::INITIAL.number(),
                        actual: md.revision().number(),
                    });
                }
                if !tlf.is_public() && !md.latest_key_generation().is_valid() {
                    return Err(ServerError::BadRequest(format!(
                        "first revision of private folder {} has no keys",
                        tlf
                    )));
                }
                if !md.is_writer(&md.last_modifying_user(), None, extra.as_ref()) {
                    return Err(ServerError::WriteAccess(format!(
                        "{} is not a writer of new folder {}",
                        md.last_modifying_user(),
                        tlf
                    )));
                }
                if let Some(limit) = self.folder_limit {
                    if inner.folders.len() >= limit {
                        return Err(ServerError::TooManyFolders {
                            count: inner.folders.len() + 1,
                            limit,
                        });
                    }
                }
            }
            (None, false) => {
                // a new branch forks off the merged revision it names
                let fork = match inner.at(tlf, BranchId::NULL, md.revision().prev())? {
                    Some(fork) => fork,
                    None => {
                        let merged = inner
                            .head(tlf, BranchId::NULL)?
                            .ok_or_else(|| ServerError::NotFound(format!("folder {}", tlf)))?;
                        return Err(ServerError::ConflictRevision {
                            expected: merged.md().revision().number().saturating_add(1),
                            actual: md.revision().number(),
                        });
                    }
                };
                let mut as_merged = md.clone();
                as_merged.set_merged();
                fork.md()
                    .check_valid_successor_for_server(&fork.md_id()?, &as_merged)?;
                let fork_extra = inner.extra_for(tlf, fork.md(), None);
                check_write_access(fork.md(), fork_extra.as_ref(), md, extra.as_ref())?;
            }
        }

        if let (Some(extra), Some((wkb_id, rkb_id))) = (extra, md.key_bundle_ids()) {
            inner
                .writer_bundles
                .entry((tlf, wkb_id))
                .or_insert(extra.wkb);
            inner
                .reader_bundles
                .entry((tlf, rkb_id))
                .or_insert(extra.rkb);
        }
        let encoded = rmds.encode()?;
        inner
            .folders
            .entry(tlf)
            .or_default()
            .entry(bid)
            .or_default()
            .insert(md.revision(), encoded);
        tracing::debug!(
            "accepted revision {} of folder {} on branch {}",
            md.revision(),
            tlf,
            bid
        );
        Ok(())
    }
}

#[async_trait]
impl MdServer for MemoryMdServer {
    async fn put(
        &self,
        ctx: &RequestContext,
        rmds: &RootMetadataSigned,
        extra: Option<&ExtraMetadataV3>,
    ) -> Result<(), ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let result = self.put_locked(rmds, extra).instrument(ctx.span()).await;
        if let Err(e) = &result {
            tracing::warn!(
                trace_id = %ctx.trace_id(),
                "rejected revision {} of folder {}: {}",
                rmds.md().revision(),
                rmds.md().tlf_id(),
                e
            );
        }
        result
    }

    async fn get_for_tlf(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let bid = branch_for(bid, status)?;
        self.inner.read().head(tlf, bid)
    }

    async fn get_range(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
    ) -> Result<Vec<RootMetadataSigned>, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let bid = branch_for(bid, status)?;
        if start < Revision::INITIAL || start > stop {
            return Err(ServerError::BadRequest(format!(
                "invalid revision range {}..={}",
                start, stop
            )));
        }
        let inner = self.inner.read();
        let Some(revisions) = inner.branch(tlf, bid) else {
            return Ok(Vec::new());
        };
        revisions
            .range(start..=stop)
            .map(|(_, encoded)| decode(encoded))
            .collect()
    }

    async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        wkb_id: &TlfWriterKeyBundleId,
        rkb_id: &TlfReaderKeyBundleId,
    ) -> Result<ExtraMetadataV3, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let wkb = inner
            .writer_bundles
            .get(&(tlf, wkb_id.clone()))
            .ok_or_else(|| ServerError::NotFound(format!("writer bundle {}", wkb_id)))?;
        let rkb = inner
            .reader_bundles
            .get(&(tlf, rkb_id.clone()))
            .ok_or_else(|| ServerError::NotFound(format!("reader bundle {}", rkb_id)))?;
        Ok(ExtraMetadataV3::new(wkb.clone(), rkb.clone(), false, false))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::md::MetadataFlags;
    use crate::testkit::{sign, successor, KeyedFolder, TestDevice};

    #[tokio::test]
    async fn test_put_and_get_chain() {
        let server = MemoryMdServer::new();
        let ctx = RequestContext::new();
        let alice = TestDevice::generate();
        for version in [MetadataVer::INITIAL_EXTRA, MetadataVer::SEGREGATED_KEY_BUNDLES] {
            let folder = KeyedFolder::new(version, &[&alice], &[]).unwrap();
            let tlf = folder.md.tlf_id();
            let first = sign(folder.md.clone(), &alice).unwrap();
            server.put(&ctx, &first, folder.extra.as_ref()).await.unwrap();

            // the second revision relies on the stored bundles
            let (mut next, _) = successor(&first, folder.extra.as_ref()).unwrap();
            next.add_ref_bytes(42).unwrap();
            let second = sign(next, &alice).unwrap();
            server.put(&ctx, &second, None).await.unwrap();

            let head = server
                .get_for_tlf(&ctx, tlf, BranchId::NULL, MergeStatus::Merged)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(head, second);

            let range = server
                .get_range(
                    &ctx,
                    tlf,
                    BranchId::NULL,
                    MergeStatus::Merged,
                    Revision::INITIAL,
                    Revision::new(10),
                )
                .await
                .unwrap();
            assert_eq!(range, vec![first, second]);

            if let Some((wkb_id, rkb_id)) = head.md().key_bundle_ids() {
                let extra = server.get_key_bundles(&ctx, tlf, &wkb_id, &rkb_id).await.unwrap();
                assert_eq!(Some(extra.wkb), folder.extra.map(|e| e.wkb));
            }
        }
    }

    #[tokio::test]
    async fn test_put_conflicts() {
        let server = MemoryMdServer::new();
        let ctx = RequestContext::new();
        let alice = TestDevice::generate();
        let folder = KeyedFolder::new(MetadataVer::SEGREGATED_KEY_BUNDLES, &[&alice], &[]).unwrap();
        let first = sign(folder.md.clone(), &alice).unwrap();
        server.put(&ctx, &first, folder.extra.as_ref()).await.unwrap();

        let (mut skipped, _) = successor(&first, folder.extra.as_ref()).unwrap();
        skipped.set_revision(Revision::new(5));
        let err = server.put(&ctx, &sign(skipped, &alice).unwrap(), None).await.unwrap_err();
        assert_eq!(
            err,
            ServerError::ConflictRevision {
                expected: 2,
                actual: 5
            }
        );

        let (mut wrong_usage, _) = successor(&first, folder.extra.as_ref()).unwrap();
        wrong_usage.set_disk_usage(1);
        let err = server.put(&ctx, &sign(wrong_usage, &alice).unwrap(), None).await.unwrap_err();
        assert!(matches!(err, ServerError::ConflictDiskUsage { md: false, .. }));

        // replaying the head is a revision conflict too
        let err = server.put(&ctx, &first, None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_write_access() {
        let server = MemoryMdServer::new();
        let ctx = RequestContext::new();
        let alice = TestDevice::generate();
        let bob = TestDevice::generate();
        let folder = KeyedFolder::new(MetadataVer::SEGREGATED_KEY_BUNDLES, &[&alice], &[&bob]).unwrap();
        let first = sign(folder.md.clone(), &alice).unwrap();
        server.put(&ctx, &first, folder.extra.as_ref()).await.unwrap();

        // a reader changing writer metadata is not a rekey request
        let (mut next, _) = successor(&first, folder.extra.as_ref()).unwrap();
        next.set_last_modifying_user(bob.uid);
        next.add_ref_bytes(7).unwrap();
        let err = server.put(&ctx, &sign(next, &bob).unwrap(), None).await.unwrap_err();
        assert!(matches!(err, ServerError::WriteAccess(_)));
    }

    #[tokio::test]
    async fn test_unmerged_branch() {
        let server = MemoryMdServer::new();
        let ctx = RequestContext::new();
        let alice = TestDevice::generate();
        let folder = KeyedFolder::new(MetadataVer::SEGREGATED_KEY_BUNDLES, &[&alice], &[]).unwrap();
        let tlf = folder.md.tlf_id();
        let first = sign(folder.md.clone(), &alice).unwrap();
        server.put(&ctx, &first, folder.extra.as_ref()).await.unwrap();

        let bid = BranchId::generate();
        let (mut forked, _) = successor(&first, folder.extra.as_ref()).unwrap();
        forked.set_unmerged(bid);
        let forked = sign(forked, &alice).unwrap();
        server.put(&ctx, &forked, None).await.unwrap();

        let (next, _) = successor(&forked, folder.extra.as_ref()).unwrap();
        server.put(&ctx, &sign(next, &alice).unwrap(), None).await.unwrap();

        let head = server
            .get_for_tlf(&ctx, tlf, bid, MergeStatus::Unmerged)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.md().revision(), Revision::new(3));
        let merged = server
            .get_for_tlf(&ctx, tlf, BranchId::NULL, MergeStatus::Merged)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged, first);

        assert!(matches!(
            server
                .get_for_tlf(&ctx, tlf, bid, MergeStatus::Merged)
                .await
                .unwrap_err(),
            ServerError::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_final_copy_is_accepted_and_ends_the_chain() {
        let server = MemoryMdServer::new();
        let ctx = RequestContext::new();
        let alice = TestDevice::generate();
        let folder = KeyedFolder::new(MetadataVer::SEGREGATED_KEY_BUNDLES, &[&alice], &[]).unwrap();
        let first = sign(folder.md.clone(), &alice).unwrap();
        server.put(&ctx, &first, folder.extra.as_ref()).await.unwrap();

        let finalized = first
            .make_final_copy(crate::tlf::HandleExtension::new_finalized(
                1,
                None,
                time::OffsetDateTime::now_utc(),
            ))
            .unwrap();
        assert!(finalized.md().flags().contains(MetadataFlags::FINAL));
        server.put(&ctx, &finalized, None).await.unwrap();

        let (next, _) = successor(&first, folder.extra.as_ref()).unwrap();
        let mut next = next;
        next.set_revision(Revision::new(3));
        let err = server.put(&ctx, &sign(next, &alice).unwrap(), None).await.unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_folder_limit_and_deadline() {
        let server = MemoryMdServer::new().with_folder_limit(1);
        let ctx = RequestContext::new();
        let alice = TestDevice::generate();
        let one = KeyedFolder::new(MetadataVer::LATEST, &[&alice], &[]).unwrap();
        let two = KeyedFolder::new(MetadataVer::LATEST, &[&alice], &[]).unwrap();
        server
            .put(&ctx, &sign(one.md.clone(), &alice).unwrap(), one.extra.as_ref())
            .await
            .unwrap();
        let err = server
            .put(&ctx, &sign(two.md.clone(), &alice).unwrap(), two.extra.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, ServerError::TooManyFolders { count: 2, limit: 1 });

        let expired = RequestContext::new().with_timeout(std::time::Duration::ZERO);
        let err = server
            .put(&expired, &sign(two.md.clone(), &alice).unwrap(), two.extra.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, ServerError::DeadlineExceeded);
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::context::RequestContext;
use crate::hash::Hash;
use crate::merkle::{MerkleRoot, MerkleTreeId, StoredMerkleLeaf};
use crate::tlf::TlfId;

use super::errors::ServerError;

#[async_trait]
pub trait MerkleService: Send + Sync + std::fmt::Debug + 'static {
    /// Replace the folder's leaf and publish a new root that includes it
    async fn submit_leaf(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        leaf: StoredMerkleLeaf,
    ) -> Result<MerkleRoot, ServerError>;

    /// The folder's current leaf and the root it was published under
    async fn get_leaf(
        &self,
        ctx: &RequestContext,
        tree_id: MerkleTreeId,
        tlf: TlfId,
    ) -> Result<Option<(StoredMerkleLeaf, MerkleRoot)>, ServerError>;

    async fn get_root(
        &self,
        ctx: &RequestContext,
        tree_id: MerkleTreeId,
    ) -> Result<Option<MerkleRoot>, ServerError>;
}

#[derive(Debug, Default)]
struct MerkleTree {
    leaves: BTreeMap<TlfId, (StoredMerkleLeaf, u64)>,
    roots: Vec<MerkleRoot>,
}

impl MerkleTree {
    /// Binary hash tree over `H(tlf || leaf)` in folder order; an odd node
    /// is carried up unchanged
    fn root_hash(&self) -> Result<Hash, ServerError> {
        let mut level = self
            .leaves
            .iter()
            .map(|(tlf, (leaf, _))| {
                let encoded = leaf
                    .encode()
                    .map_err(|e| ServerError::BadRequest(e.to_string()))?;
                let mut buf = tlf.bytes().to_vec();
                buf.extend_from_slice(&encoded);
                Ok(Hash::default_hash(&buf))
            })
            .collect::<Result<Vec<_>, ServerError>>()?;
        if level.is_empty() {
            return Ok(Hash::default_hash(&[]));
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => {
                        let mut buf = left.bytes().to_vec();
                        buf.extend_from_slice(right.bytes());
                        Hash::default_hash(&buf)
                    }
                    _ => pair[0].clone(),
                })
                .collect();
        }
        Ok(level.remove(0))
    }
}

/// In-memory Merkle service with one tree per [`MerkleTreeId`]
#[derive(Debug, Clone, Default)]
pub struct MemoryMerkleService {
    inner: Arc<RwLock<HashMap<MerkleTreeId, MerkleTree>>>,
}

impl MemoryMerkleService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MerkleService for MemoryMerkleService {
    async fn submit_leaf(
        &self,
        ctx: &RequestContext,
        tlf: TlfId,
        leaf: StoredMerkleLeaf,
    ) -> Result<MerkleRoot, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let expected_tree = if tlf.is_public() {
            MerkleTreeId::PUBLIC
        } else {
            MerkleTreeId::PRIVATE
        };
        if leaf.tree_id() != expected_tree {
            return Err(ServerError::BadRequest(format!(
                "leaf for folder {} belongs in tree {}",
                tlf, expected_tree
            )));
        }

        let mut inner = self.inner.write();
        let tree = inner.entry(expected_tree).or_default();
        if let (StoredMerkleLeaf::Plain(new), Some((StoredMerkleLeaf::Plain(old), _))) =
            (&leaf, tree.leaves.get(&tlf))
        {
            if new.revision <= old.revision {
                return Err(ServerError::ConflictRevision {
                    expected: old.revision.number().saturating_add(1),
                    actual: new.revision.number(),
                });
            }
        }

        let seqno = tree.roots.last().map_or(1, |root| root.seqno + 1);
        let previous = tree.leaves.insert(tlf, (leaf, seqno));
        let hash = match tree.root_hash() {
            Ok(hash) => hash,
            Err(e) => {
                // leave the tree as it was
                match previous {
                    Some(previous) => tree.leaves.insert(tlf, previous),
                    None => tree.leaves.remove(&tlf),
                };
                return Err(e);
            }
        };
        let root = MerkleRoot {
            tree_id: expected_tree,
            seqno,
            hash,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        };
        tree.roots.push(root.clone());
        tracing::debug!(
            trace_id = %ctx.trace_id(),
            "folder {} anchored in tree {} at seqno {}",
            tlf,
            expected_tree,
            seqno
        );
        Ok(root)
    }

    async fn get_leaf(
        &self,
        ctx: &RequestContext,
        tree_id: MerkleTreeId,
        tlf: TlfId,
    ) -> Result<Option<(StoredMerkleLeaf, MerkleRoot)>, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let Some(tree) = inner.get(&tree_id) else {
            return Ok(None);
        };
        let Some((leaf, seqno)) = tree.leaves.get(&tlf) else {
            return Ok(None);
        };
        let root = tree
            .roots
            .iter()
            .find(|root| root.seqno == *seqno)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("root {} of tree {}", seqno, tree_id)))?;
        Ok(Some((leaf.clone(), root)))
    }

    async fn get_root(
        &self,
        ctx: &RequestContext,
        tree_id: MerkleTreeId,
    ) -> Result<Option<MerkleRoot>, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        Ok(self
            .inner
            .read()
            .get(&tree_id)
            .and_then(|tree| tree.roots.last().cloned()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{TlfEphemeralPrivateKey, TlfPrivateKey};
    use crate::md::{KeyGen, Revision};
    use crate::merkle::MerkleLeaf;
    use crate::tlf::TlfType;

    fn leaf(revision: u64) -> MerkleLeaf {
        MerkleLeaf::new(
            Revision::new(revision),
            Hash::default_hash(&revision.to_be_bytes()),
            OffsetDateTime::now_utc(),
        )
    }

    #[tokio::test]
    async fn test_public_leaves() {
        let service = MemoryMerkleService::new();
        let ctx = RequestContext::new();
        let tlf = TlfId::generate(TlfType::Public);

        let first = service
            .submit_leaf(&ctx, tlf, StoredMerkleLeaf::Plain(leaf(1)))
            .await
            .unwrap();
        let second_leaf = StoredMerkleLeaf::Plain(leaf(2));
        let second = service
            .submit_leaf(&ctx, tlf, second_leaf.clone())
            .await
            .unwrap();
        assert_eq!(second.seqno, first.seqno + 1);
        assert_ne!(second.hash, first.hash);

        let err = service
            .submit_leaf(&ctx, tlf, StoredMerkleLeaf::Plain(leaf(2)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let (stored, root) = service
            .get_leaf(&ctx, MerkleTreeId::PUBLIC, tlf)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, second_leaf);
        assert_eq!(root, second);
        assert_eq!(
            service.get_root(&ctx, MerkleTreeId::PUBLIC).await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_private_leaves_are_sealed() {
        let service = MemoryMerkleService::new();
        let ctx = RequestContext::new();
        let tlf = TlfId::generate(TlfType::Private);

        let err = service
            .submit_leaf(&ctx, tlf, StoredMerkleLeaf::Plain(leaf(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        let tlf_key = TlfPrivateKey::generate();
        let sealed = leaf(1)
            .encrypt(KeyGen::FIRST_VALID, &tlf_key.public(), &TlfEphemeralPrivateKey::generate())
            .unwrap();
        service
            .submit_leaf(&ctx, tlf, StoredMerkleLeaf::Encrypted(sealed.clone()))
            .await
            .unwrap();
        let (stored, _) = service
            .get_leaf(&ctx, MerkleTreeId::PRIVATE, tlf)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, StoredMerkleLeaf::Encrypted(sealed));
        assert!(service
            .get_leaf(&ctx, MerkleTreeId::PUBLIC, tlf)
            .await
            .unwrap()
            .is_none());
    }
}

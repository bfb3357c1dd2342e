//! Merkle anchoring of signed revisions
//!
//! Every accepted revision is recorded as a leaf in a global Merkle tree so
//! that a server cannot show different histories to different clients. Leaves
//! of private folders are sealed to the folder's per-generation TLF public key
//! so that only members can see which revision a leaf describes.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::{self, UnknownFields};
use crate::crypto::{
    open_sealed, seal_to, CryptoError, EncryptedData, TlfEphemeralPrivateKey,
    TlfEphemeralPublicKey, TlfPrivateKey, TlfPublicKey,
};
use crate::hash::Hash;
use crate::md::{KeyGen, MdError, Revision, RootMetadataSigned};

/// Which tree a leaf lives in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MerkleTreeId(u8);

impl MerkleTreeId {
    pub const PUBLIC: MerkleTreeId = MerkleTreeId(0);
    pub const PRIVATE: MerkleTreeId = MerkleTreeId(1);

    pub fn from_u8(value: u8) -> Self {
        MerkleTreeId(value)
    }
}

impl fmt::Display for MerkleTreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binds one revision's envelope hash into the tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub revision: Revision,
    /// Hash of the encoded [`RootMetadataSigned`]
    pub hash: Hash,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl MerkleLeaf {
    pub fn new(revision: Revision, hash: Hash, now: OffsetDateTime) -> Self {
        MerkleLeaf {
            revision,
            hash,
            timestamp: now.unix_timestamp(),
            unknown: UnknownFields::new(),
        }
    }

    /// The leaf for a signed revision
    pub fn for_signed(rmds: &RootMetadataSigned, now: OffsetDateTime) -> Result<Self, MdError> {
        Ok(MerkleLeaf::new(rmds.md().revision(), rmds.hash()?, now))
    }

    /// Check that this leaf anchors `rmds`
    pub fn matches(&self, rmds: &RootMetadataSigned) -> Result<bool, MdError> {
        Ok(self.revision == rmds.md().revision() && self.hash == rmds.hash()?)
    }

    /// Seal to the folder's TLF public key with a fresh ephemeral key
    pub fn encrypt(
        &self,
        key_gen: KeyGen,
        tlf_public_key: &TlfPublicKey,
        ephemeral: &TlfEphemeralPrivateKey,
    ) -> Result<EncryptedMerkleLeaf, CryptoError> {
        let encoded = codec::encode(self)?;
        let encrypted = seal_to(&encoded, &tlf_public_key.to_x25519(), &ephemeral.to_x25519())?;
        Ok(EncryptedMerkleLeaf {
            key_gen,
            ephemeral_public_key: ephemeral.public(),
            encrypted,
        })
    }
}

/// A leaf sealed to a private folder's members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMerkleLeaf {
    /// Generation whose TLF key pair sealed the leaf
    pub key_gen: KeyGen,
    pub ephemeral_public_key: TlfEphemeralPublicKey,
    pub encrypted: EncryptedData,
}

impl EncryptedMerkleLeaf {
    pub fn decrypt(&self, tlf_private_key: &TlfPrivateKey) -> Result<MerkleLeaf, CryptoError> {
        let encoded = open_sealed(
            &self.encrypted,
            &tlf_private_key.to_x25519(),
            &self.ephemeral_public_key.to_x25519(),
        )?;
        Ok(codec::decode(&encoded)?)
    }
}

/// What the tree stores per folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredMerkleLeaf {
    Plain(MerkleLeaf),
    Encrypted(EncryptedMerkleLeaf),
}

impl StoredMerkleLeaf {
    pub fn tree_id(&self) -> MerkleTreeId {
        match self {
            StoredMerkleLeaf::Plain(_) => MerkleTreeId::PUBLIC,
            StoredMerkleLeaf::Encrypted(_) => MerkleTreeId::PRIVATE,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(codec::encode(self)?)
    }
}

/// A published tree root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MerkleRoot {
    pub tree_id: MerkleTreeId,
    /// Strictly increasing per tree
    pub seqno: u64,
    pub hash: Hash,
    pub timestamp: i64,
}

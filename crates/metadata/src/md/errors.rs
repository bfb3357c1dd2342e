use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::hash::HashError;
use crate::tlf::{TlfError, TlfId, UserId};

use super::types::{BranchId, KeyGen, MetadataId, MetadataVer, Revision};

#[derive(Debug, thiserror::Error)]
pub enum MdError {
    #[error("metadata error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("hash error: {0}")]
    Hash(#[from] HashError),
    #[error("folder error: {0}")]
    Tlf(#[from] TlfError),

    // format / version
    #[error("metadata version {version} is below the minimum {min}")]
    VersionTooOld {
        version: MetadataVer,
        min: MetadataVer,
    },
    #[error("metadata version {0} is not understood by this client")]
    UnsupportedVersion(MetadataVer),
    #[error("envelope version {envelope} does not match metadata version {md}")]
    VersionMismatch {
        envelope: MetadataVer,
        md: MetadataVer,
    },
    #[error("invalid metadata: {0}")]
    Invalid(String),

    // chain integrity
    #[error("metadata at revision {0} is final and cannot have a successor")]
    MetadataIsFinal(Revision),
    #[error("folder ID mismatch: current {current}, next {next}")]
    TlfIdMismatch { current: TlfId, next: TlfId },
    #[error("revision {0} has no successor")]
    RevisionOverflow(Revision),
    #[error("revision mismatch: current {current}, next {next}")]
    RevisionMismatch { current: Revision, next: Revision },
    #[error("prev root mismatch: expected {expected}, got {actual}")]
    PrevRootMismatch {
        expected: MetadataId,
        actual: MetadataId,
    },
    #[error("branch ID mismatch: current {current}, next {next}")]
    BranchIdMismatch { current: BranchId, next: BranchId },
    #[error("unmerged metadata cannot follow merged metadata")]
    UnmergedAfterMerged,
    #[error("disk usage mismatch: expected {expected}, got {actual}")]
    DiskUsageMismatch { expected: u64, actual: u64 },
    #[error("metadata disk usage mismatch: expected {expected}, got {actual}")]
    MdDiskUsageMismatch { expected: u64, actual: u64 },
    #[error("{counter} is {current}, cannot apply {bytes} bytes")]
    UsageOutOfRange {
        counter: &'static str,
        current: u64,
        bytes: u64,
    },

    // keys
    #[error("public folders have no keys")]
    PublicFolder,
    #[error("key generation {key_gen} is not valid (latest is {latest})")]
    InvalidKeyGeneration { key_gen: KeyGen, latest: KeyGen },
    #[error("no key info for user {uid} at key generation {key_gen}")]
    MissingKeyInfo { uid: UserId, key_gen: KeyGen },
    #[error("ephemeral key index {index} out of range ({count} keys)")]
    InvalidEphemeralKeyIndex { index: i64, count: usize },
    #[error("expected {expected} folder crypt keys, got {actual}")]
    KeyCountMismatch { expected: usize, actual: usize },
    #[error("missing key bundle {0}")]
    MissingKeyBundle(String),
    #[error("key bundle ID mismatch: expected {expected}, got {actual}")]
    KeyBundleIdMismatch { expected: String, actual: String },
    #[error("server half removal conflict: {0}")]
    RemovalInfoConflict(String),

    // signatures
    #[error("last modifier mismatch: {0}")]
    LastModifierMismatch(String),
}

impl MdError {
    /// Whether retrying (after re-fetching state) can succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, MdError::MissingKeyBundle(_))
    }

    /// Chain-integrity failures that a caller may resolve by re-fetching the
    /// head and rebasing
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MdError::RevisionMismatch { .. }
                | MdError::PrevRootMismatch { .. }
                | MdError::DiskUsageMismatch { .. }
                | MdError::MdDiskUsageMismatch { .. }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(MdError::MissingKeyBundle("abc".into()).is_retriable());
        assert!(!MdError::Crypto(CryptoError::Decryption).is_retriable());
        assert!(!MdError::Crypto(CryptoError::NonceMismatch).is_retriable());
        assert!(MdError::RevisionMismatch {
            current: Revision::INITIAL,
            next: Revision::new(5),
        }
        .is_conflict());
        assert!(!MdError::UnmergedAfterMerged.is_conflict());
    }
}

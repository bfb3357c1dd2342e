use crate::md::{MdError, MetadataId, Revision};

/// Errors reported by the metadata, key and Merkle servers.
///
/// The conflict variants mirror local chain checks so a client can map a
/// rejected put back onto the check that would have caught it.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("revision conflict: expected {expected}, got {actual}")]
    ConflictRevision { expected: u64, actual: u64 },
    #[error("prev root conflict: expected {expected}, got {actual}")]
    ConflictPrevRoot {
        expected: MetadataId,
        actual: MetadataId,
    },
    /// Also used for metadata disk usage, flagged by `md`
    #[error("disk usage conflict: expected {expected}, got {actual}")]
    ConflictDiskUsage { expected: u64, actual: u64, md: bool },
    #[error("folder mapping conflict: {0}")]
    ConflictFolderMapping(String),
    #[error("folder is locked: {0}")]
    Locked(String),
    #[error("throttled, retry after {retry_after_secs}s")]
    Throttle { retry_after_secs: u64 },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("no write access: {0}")]
    WriteAccess(String),
    #[error("too many folders: {count} exceeds {limit}")]
    TooManyFolders { count: usize, limit: usize },
    #[error("missing folder handle: {0}")]
    MissingHandle(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl ServerError {
    /// Whether retrying the same request later may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ServerError::Locked(_) | ServerError::Throttle { .. } | ServerError::DeadlineExceeded
        )
    }

    /// Whether the client should re-fetch the head and rebase
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ServerError::ConflictRevision { .. }
                | ServerError::ConflictPrevRoot { .. }
                | ServerError::ConflictDiskUsage { .. }
                | ServerError::ConflictFolderMapping(_)
        )
    }

    /// The local chain error this conflict corresponds to, if any
    pub fn to_md_error(&self) -> Option<MdError> {
        match self {
            ServerError::ConflictRevision { expected, actual } => Some(MdError::RevisionMismatch {
                current: Revision::new(*expected).prev(),
                next: Revision::new(*actual),
            }),
            ServerError::ConflictPrevRoot { expected, actual } => Some(MdError::PrevRootMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            ServerError::ConflictDiskUsage {
                expected,
                actual,
                md: false,
            } => Some(MdError::DiskUsageMismatch {
                expected: *expected,
                actual: *actual,
            }),
            ServerError::ConflictDiskUsage {
                expected,
                actual,
                md: true,
            } => Some(MdError::MdDiskUsageMismatch {
                expected: *expected,
                actual: *actual,
            }),
            ServerError::NotFound(what) => Some(MdError::MissingKeyBundle(what.clone())),
            _ => None,
        }
    }
}

impl From<MdError> for ServerError {
    fn from(err: MdError) -> Self {
        match err {
            MdError::RevisionMismatch { current, next } => ServerError::ConflictRevision {
                expected: current.number().saturating_add(1),
                actual: next.number(),
            },
            MdError::PrevRootMismatch { expected, actual } => {
                ServerError::ConflictPrevRoot { expected, actual }
            }
            MdError::DiskUsageMismatch { expected, actual } => ServerError::ConflictDiskUsage {
                expected,
                actual,
                md: false,
            },
            MdError::MdDiskUsageMismatch { expected, actual } => ServerError::ConflictDiskUsage {
                expected,
                actual,
                md: true,
            },
            MdError::TlfIdMismatch { .. } => ServerError::ConflictFolderMapping(err.to_string()),
            MdError::MissingKeyBundle(what) => ServerError::NotFound(what),
            MdError::Crypto(_) | MdError::LastModifierMismatch(_) => {
                ServerError::Unauthorized(err.to_string())
            }
            other => ServerError::BadRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::CryptoError;

    #[test]
    fn test_chain_errors_map_both_ways() {
        let chain_errors = vec![
            MdError::RevisionMismatch {
                current: Revision::new(4),
                next: Revision::new(9),
            },
            MdError::PrevRootMismatch {
                expected: MetadataId::from_encoded(b"a"),
                actual: MetadataId::from_encoded(b"b"),
            },
            MdError::DiskUsageMismatch {
                expected: 10,
                actual: 11,
            },
            MdError::MdDiskUsageMismatch {
                expected: 3,
                actual: 4,
            },
        ];
        for err in chain_errors {
            let expected = err.to_string();
            let server = ServerError::from(err);
            assert!(server.is_conflict());
            assert_eq!(server.to_md_error().unwrap().to_string(), expected);
        }
    }

    #[test]
    fn test_other_errors() {
        let err = ServerError::from(MdError::Crypto(CryptoError::MissingSignature));
        assert!(matches!(err, ServerError::Unauthorized(_)));
        assert!(err.to_md_error().is_none());
        assert!(matches!(
            ServerError::from(MdError::UnmergedAfterMerged),
            ServerError::BadRequest(_)
        ));
        assert!(ServerError::Throttle { retry_after_secs: 1 }.is_retriable());
        assert!(!ServerError::WriteAccess("x".to_string()).is_retriable());
    }
}

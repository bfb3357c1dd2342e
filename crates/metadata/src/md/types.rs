use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::hash::{Hash, HashError};

/// Wire version of a root metadata object.
///
/// | value | meaning                                   | representation |
/// |-------|-------------------------------------------|----------------|
/// | 0     | invalid                                   |                |
/// | 1     | first valid version                       | V2             |
/// | 2     | carries an initial extra field            | V2             |
/// | 3     | key bundles stored outside the metadata   | V3             |
/// | 4     | implicit team folders                     | V3             |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataVer(u8);

impl MetadataVer {
    pub const INVALID: MetadataVer = MetadataVer(0);
    pub const FIRST_VALID: MetadataVer = MetadataVer(1);
    pub const INITIAL_EXTRA: MetadataVer = MetadataVer(2);
    pub const SEGREGATED_KEY_BUNDLES: MetadataVer = MetadataVer(3);
    pub const IMPLICIT_TEAMS: MetadataVer = MetadataVer(4);

    /// Newest version this client can fully comprehend
    pub const LATEST: MetadataVer = MetadataVer::IMPLICIT_TEAMS;

    pub fn from_u8(value: u8) -> Self {
        MetadataVer(value)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self >= MetadataVer::FIRST_VALID
    }

    /// Whether key bundles live outside the metadata object
    pub fn has_segregated_key_bundles(&self) -> bool {
        *self >= MetadataVer::SEGREGATED_KEY_BUNDLES
    }
}

impl fmt::Display for MetadataVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a metadata object in its folder's (branch's) history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub const UNINITIALIZED: Revision = Revision(0);
    pub const INITIAL: Revision = Revision(1);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    pub fn number(&self) -> u64 {
        self.0
    }

    /// The following revision, or `None` at `u64::MAX`
    pub fn checked_next(&self) -> Option<Revision> {
        self.0.checked_add(1).map(Revision)
    }

    /// The previous revision, saturating at [`Revision::UNINITIALIZED`]
    pub fn prev(&self) -> Revision {
        Revision(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation of a folder's symmetric key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyGen(i64);

impl KeyGen {
    /// Public folders have no keys
    pub const PUBLIC: KeyGen = KeyGen(-1);
    /// A private folder that has not been keyed yet
    pub const UNSPECIFIED: KeyGen = KeyGen(0);
    pub const FIRST_VALID: KeyGen = KeyGen(1);

    pub fn new(value: i64) -> Self {
        KeyGen(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn checked_next(&self) -> Option<KeyGen> {
        self.0.checked_add(1).map(KeyGen)
    }

    pub fn is_valid(&self) -> bool {
        *self >= KeyGen::FIRST_VALID
    }

    /// Zero-based index into a per-generation list
    pub(crate) fn index(&self) -> Option<usize> {
        if self.is_valid() {
            usize::try_from(self.0 - 1).ok()
        } else {
            None
        }
    }

    pub(crate) fn from_count(count: usize) -> KeyGen {
        KeyGen(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const BRANCH_ID_BYTE_LEN: usize = 16;

/// Identifies a device's unmerged (conflict) branch of a folder
#[serde_as]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(#[serde_as(as = "Bytes")] [u8; BRANCH_ID_BYTE_LEN]);

impl BranchId {
    /// The merged branch
    pub const NULL: BranchId = BranchId([0; BRANCH_ID_BYTE_LEN]);
    /// Reserved for a local squash of unmerged revisions
    pub const PENDING_LOCAL_SQUASH: BranchId = BranchId([0xff; BRANCH_ID_BYTE_LEN]);

    pub fn generate() -> Self {
        loop {
            let id = BranchId(crate::crypto::random_bytes());
            if id != BranchId::NULL && id != BranchId::PENDING_LOCAL_SQUASH {
                return id;
            }
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let mut bytes = [0u8; BRANCH_ID_BYTE_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| HashError::InvalidHex(e.to_string()))?;
        Ok(BranchId(bytes))
    }

    pub fn is_null(&self) -> bool {
        *self == BranchId::NULL
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({})", hex::encode(self.0))
    }
}

impl FromStr for BranchId {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BranchId::from_hex(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Merged => write!(f, "merged"),
            MergeStatus::Unmerged => write!(f, "unmerged"),
        }
    }
}

/// Flags covered only by the root signature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFlags(u8);

impl MetadataFlags {
    /// A rekey has been requested
    pub const REKEY: u8 = 1;
    /// The writer metadata was copied from the predecessor untouched
    pub const WRITER_METADATA_COPIED: u8 = 1 << 1;
    /// The last revision of a finalized folder
    pub const FINAL: u8 = 1 << 2;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Flags covered by the writer signature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriterFlags(u8);

impl WriterFlags {
    pub const UNMERGED: u8 = 1;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }
}

/// Content address of an encoded root metadata object
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataId(Hash);

impl MetadataId {
    pub fn from_encoded(encoded: &[u8]) -> Self {
        MetadataId(Hash::default_hash(encoded))
    }

    pub fn from_hash(hash: Hash) -> Self {
        MetadataId(hash)
    }

    pub fn hash(&self) -> &Hash {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for MetadataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MetadataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataId({})", self.0)
    }
}

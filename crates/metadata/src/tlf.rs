//! Folder identity
//!
//! A top-level folder (TLF) is identified by a random 16-byte [`TlfId`]
//! whose final byte records whether the folder is private or public. Users
//! are identified by a 16-byte [`UserId`]; participants that have not yet
//! proven their identity are carried as unresolved [`SocialAssertion`]s.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use time::OffsetDateTime;

use crate::codec::UnknownFields;

/// Length of a folder ID in bytes, suffix included
pub const TLF_ID_BYTE_LEN: usize = 16;
/// Length of a user ID in bytes
pub const USER_ID_BYTE_LEN: usize = 16;

const PRIVATE_TLF_SUFFIX: u8 = 0x16;
const PUBLIC_TLF_SUFFIX: u8 = 0x17;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TlfError {
    #[error("invalid folder ID: {0}")]
    InvalidTlfId(String),
    #[error("invalid user ID: {0}")]
    InvalidUserId(String),
    #[error("invalid social assertion: {0}")]
    InvalidAssertion(String),
}

/// Whether a folder's contents are encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlfType {
    Private,
    Public,
}

impl fmt::Display for TlfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlfType::Private => write!(f, "private"),
            TlfType::Public => write!(f, "public"),
        }
    }
}

/// Unique folder identifier
#[serde_as]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TlfId(#[serde_as(as = "Bytes")] [u8; TLF_ID_BYTE_LEN]);

impl TlfId {
    /// A fresh random ID of the given type
    pub fn generate(tlf_type: TlfType) -> Self {
        let mut bytes: [u8; TLF_ID_BYTE_LEN] = crate::crypto::random_bytes();
        bytes[TLF_ID_BYTE_LEN - 1] = match tlf_type {
            TlfType::Private => PRIVATE_TLF_SUFFIX,
            TlfType::Public => PUBLIC_TLF_SUFFIX,
        };
        TlfId(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TlfError> {
        let bytes: [u8; TLF_ID_BYTE_LEN] = bytes.try_into().map_err(|_| {
            TlfError::InvalidTlfId(format!("expected {} bytes, got {}", TLF_ID_BYTE_LEN, bytes.len()))
        })?;
        let id = TlfId(bytes);
        id.tlf_type()?;
        Ok(id)
    }

    pub fn from_hex(s: &str) -> Result<Self, TlfError> {
        let bytes = hex::decode(s).map_err(|e| TlfError::InvalidTlfId(e.to_string()))?;
        TlfId::from_bytes(&bytes)
    }

    pub fn bytes(&self) -> &[u8; TLF_ID_BYTE_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; TLF_ID_BYTE_LEN]
    }

    pub fn tlf_type(&self) -> Result<TlfType, TlfError> {
        match self.0[TLF_ID_BYTE_LEN - 1] {
            PRIVATE_TLF_SUFFIX => Ok(TlfType::Private),
            PUBLIC_TLF_SUFFIX => Ok(TlfType::Public),
            other => Err(TlfError::InvalidTlfId(format!("unknown suffix {:#04x}", other))),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self.tlf_type(), Ok(TlfType::Public))
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({})", hex::encode(self.0))
    }
}

impl FromStr for TlfId {
    type Err = TlfError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TlfId::from_hex(s)
    }
}

/// Unique user identifier
#[serde_as]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(#[serde_as(as = "Bytes")] [u8; USER_ID_BYTE_LEN]);

impl UserId {
    pub fn generate() -> Self {
        UserId(crate::crypto::random_bytes())
    }

    pub fn from_bytes(bytes: [u8; USER_ID_BYTE_LEN]) -> Self {
        UserId(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, TlfError> {
        let mut bytes = [0u8; USER_ID_BYTE_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| TlfError::InvalidUserId(e.to_string()))?;
        Ok(UserId(bytes))
    }

    pub fn bytes(&self) -> &[u8; USER_ID_BYTE_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; USER_ID_BYTE_LEN]
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", hex::encode(self.0))
    }
}

impl FromStr for UserId {
    type Err = TlfError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserId::from_hex(s)
    }
}

/// An identity claim (`user@service`) that has not been resolved to a user yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocialAssertion {
    pub user: String,
    pub service: String,
}

impl fmt::Display for SocialAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.service)
    }
}

impl FromStr for SocialAssertion {
    type Err = TlfError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((user, service)) if !user.is_empty() && !service.is_empty() => {
                Ok(SocialAssertion {
                    user: user.to_string(),
                    service: service.to_string(),
                })
            }
            _ => Err(TlfError::InvalidAssertion(s.to_string())),
        }
    }
}

/// Folder membership as resolved by the identity layer.
///
/// Private folders record membership in their key bundles; only public
/// folders keep the writer list in the metadata itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlfHandle {
    pub writers: Vec<UserId>,
    pub readers: Vec<UserId>,
    pub unresolved_writers: Vec<SocialAssertion>,
    pub unresolved_readers: Vec<SocialAssertion>,
    pub conflict_info: Option<HandleExtension>,
    pub finalized_info: Option<HandleExtension>,
}

impl TlfHandle {
    pub fn new(writers: Vec<UserId>, readers: Vec<UserId>) -> Self {
        TlfHandle {
            writers,
            readers,
            ..Default::default()
        }
    }

    pub fn is_writer(&self, uid: &UserId) -> bool {
        self.writers.contains(uid)
    }

    pub fn is_reader(&self, uid: &UserId) -> bool {
        self.is_writer(uid) || self.readers.contains(uid)
    }
}

/// Kind of suffix attached to a folder handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleExtensionType(u8);

impl HandleExtensionType {
    /// A conflicted copy produced by failed conflict resolution
    pub const CONFLICT: HandleExtensionType = HandleExtensionType(1);
    /// The frozen history of a folder that was reset
    pub const FINALIZED: HandleExtensionType = HandleExtensionType(2);

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Records why and when a folder was forked off (conflict) or frozen
/// (finalized).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleExtension {
    /// Unix seconds
    pub date: i64,
    /// Disambiguates several extensions created on the same date
    pub number: u16,
    #[serde(rename = "type")]
    pub extension_type: HandleExtensionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl HandleExtension {
    pub fn new(
        extension_type: HandleExtensionType,
        number: u16,
        username: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        HandleExtension {
            date: now.unix_timestamp(),
            number,
            extension_type,
            username,
            unknown: UnknownFields::new(),
        }
    }

    pub fn new_finalized(number: u16, username: Option<String>, now: OffsetDateTime) -> Self {
        Self::new(HandleExtensionType::FINALIZED, number, username, now)
    }

    pub fn new_conflict(number: u16, now: OffsetDateTime) -> Self {
        Self::new(HandleExtensionType::CONFLICT, number, None, now)
    }

    fn date_string(&self) -> String {
        match OffsetDateTime::from_unix_timestamp(self.date) {
            Ok(date) => format!(
                "{:04}-{:02}-{:02}",
                date.year(),
                u8::from(date.month()),
                date.day()
            ),
            Err(_) => self.date.to_string(),
        }
    }
}

impl fmt::Display for HandleExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let number = if self.number > 1 {
            format!(" #{}", self.number)
        } else {
            String::new()
        };
        match (self.extension_type, &self.username) {
            (HandleExtensionType::CONFLICT, _) => {
                write!(f, "(conflicted copy {}{})", self.date_string(), number)
            }
            (HandleExtensionType::FINALIZED, Some(user)) => write!(
                f,
                "(files before {} account reset {}{})",
                user,
                self.date_string(),
                number
            ),
            (HandleExtensionType::FINALIZED, None) => write!(
                f,
                "(files before account reset {}{})",
                self.date_string(),
                number
            ),
            (other, _) => write!(f, "(extension {} {}{})", other.as_u8(), self.date_string(), number),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tlf_id_type_suffix() {
        let private = TlfId::generate(TlfType::Private);
        let public = TlfId::generate(TlfType::Public);
        assert_eq!(private.tlf_type().unwrap(), TlfType::Private);
        assert!(public.is_public());

        let parsed: TlfId = private.to_string().parse().unwrap();
        assert_eq!(parsed, private);

        let mut bogus = *private.bytes();
        bogus[TLF_ID_BYTE_LEN - 1] = 0x01;
        assert!(TlfId::from_bytes(&bogus).is_err());
        assert!(TlfId::from_bytes(&bogus[..4]).is_err());
    }

    #[test]
    fn test_user_id_hex() {
        let uid = UserId::generate();
        assert_eq!(uid.to_string().parse::<UserId>().unwrap(), uid);
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn test_social_assertion_parse() {
        let a: SocialAssertion = "alice@twitter".parse().unwrap();
        assert_eq!(a.user, "alice");
        assert_eq!(a.service, "twitter");
        assert_eq!(a.to_string(), "alice@twitter");
        assert!("alice".parse::<SocialAssertion>().is_err());
        assert!("@twitter".parse::<SocialAssertion>().is_err());
    }

    #[test]
    fn test_handle_extension_display() {
        let date = OffsetDateTime::from_unix_timestamp(1_458_000_000).unwrap();
        let conflict = HandleExtension::new_conflict(2, date);
        assert_eq!(conflict.to_string(), "(conflicted copy 2016-03-15 #2)");

        let finalized = HandleExtension::new_finalized(1, Some("alice".into()), date);
        assert_eq!(
            finalized.to_string(),
            "(files before alice account reset 2016-03-15)"
        );
    }
}

//! Versioned root metadata and its key bundles
//!
//! A folder's history is a chain of [`RootMetadata`] revisions, each naming
//! its predecessor by [`MetadataId`]. Every revision is wrapped in a
//! [`RootMetadataSigned`] envelope before it leaves the client.
//!
//! # Wire versions
//!
//! | version | layout | key bundles                                  |
//! |---------|--------|----------------------------------------------|
//! | 1, 2    | V2     | every generation embedded in the metadata    |
//! | 3, 4    | V3     | latest generation stored separately, by hash |
//!
//! The representation is chosen from the version field alone. V3 bundles
//! travel next to the metadata as an [`ExtraMetadataV3`].
//!
//! # Chain rules
//!
//! A successor has the same folder ID, the next revision number, and the
//! predecessor's ID as its `prev_root`. It stays on the predecessor's branch
//! or moves from an unmerged branch back to the merged one. Its disk usage
//! equals the predecessor's plus its own ref bytes minus its unref bytes,
//! unless it only copied the predecessor's writer metadata. A final revision
//! ends the chain.

mod errors;
mod key_bundle;
mod key_bundle_v2;
mod key_bundle_v3;
mod private;
mod root_metadata;
mod root_metadata_v2;
mod root_metadata_v3;
mod signed;
mod types;

pub use errors::MdError;
pub use key_bundle::{
    DeviceKeyInfoMap, ServerHalfRemovalInfo, TlfCryptKeyInfo, UserDeviceKeyInfoMap,
    UserDevicePublicKeys, UserDeviceServerHalves, UserServerHalfRemovalInfo,
};
pub use key_bundle_v2::{
    ephemeral_public_key_v2, ReaderKeyBundleV2, ReaderKeyGenerationsV2, WriterKeyBundleV2,
    WriterKeyGenerationsV2,
};
pub use key_bundle_v3::{
    ExtraMetadataV3, ReaderKeyBundleV3, TlfReaderKeyBundleId, TlfWriterKeyBundleId,
    WriterKeyBundleV3,
};
pub use private::PrivateMetadata;
pub use root_metadata::RootMetadata;
pub use root_metadata_v2::{RootMetadataV2, WriterMetadataV2};
pub use root_metadata_v3::{RootMetadataV3, WriterMetadataV3};
pub use signed::RootMetadataSigned;
pub use types::{
    BranchId, KeyGen, MergeStatus, MetadataFlags, MetadataId, MetadataVer, Revision, WriterFlags,
    BRANCH_ID_BYTE_LEN,
};

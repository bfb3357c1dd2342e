pub mod codec;
pub mod config;
pub mod context;
/**
 * Cryptographic types and operations.
 *  - Device signing and crypt keys
 *  - Sealed client halves and key splitting
 *  - Block and metadata encryption, padding
 */
pub mod crypto;
/**
 * Content-hash identities and HMACs.
 */
pub mod hash;
/**
 * Byte-bounded cache of externally stored
 *  key bundles, shared across folders.
 */
pub mod key_bundle_cache;
/**
 * Client-side key manager: resolves crypt
 *  keys, creates folders, commits and rekeys.
 */
pub mod keys;
/**
 * Versioned root metadata, its key bundles
 *  and the signed envelope it travels in.
 * Everything that makes up a folder's
 *  revision chain lives here.
 */
pub mod md;
pub mod merkle;
/**
 * Interfaces to the metadata, key and Merkle
 *  servers, with in-memory implementations.
 */
pub mod server;
/**
 * Fixtures for tests that need keyed folders
 *  or several clients sharing servers.
 */
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod tlf;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::crypto::{CryptPrivateKey, CryptPublicKey, SigningKey, TlfCryptKey};
    pub use crate::hash::Hash;
    pub use crate::keys::{FolderHead, KeyManager, KeyManagerError, LocalDevice, RekeyOutcome};
    pub use crate::md::{
        ExtraMetadataV3, KeyGen, MdError, MetadataVer, Revision, RootMetadata,
        RootMetadataSigned,
    };
    pub use crate::server::{KeyServer, MdServer, MerkleService, ServerError};
    pub use crate::tlf::{TlfId, TlfType, UserId};
}

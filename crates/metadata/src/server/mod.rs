//! Interfaces to the services a client talks to, with in-memory
//! implementations
//!
//! - [`MdServer`] stores the signed revision chain of every folder and the
//!   V3 key bundles it references
//! - [`KeyServer`] stores server halves of folder crypt keys
//! - [`MerkleService`] anchors each folder's latest revision in a global tree
//!
//! Every call takes a [`RequestContext`](crate::context::RequestContext) and
//! fails with a [`ServerError`]. Rejected puts report conflicts that map back
//! onto the local chain checks via [`ServerError::to_md_error`].

mod errors;
mod key_server;
mod locks;
mod md_server;
mod merkle;

pub use errors::ServerError;
pub use key_server::{KeyServer, MemoryKeyServer};
pub use locks::{FolderLockGuard, FolderLocks};
pub use md_server::{MdServer, MemoryMdServer};
pub use merkle::{MemoryMerkleService, MerkleService};

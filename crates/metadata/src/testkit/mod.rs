/// In-process fixtures for metadata and key manager tests
///
/// [`TestEnv`] shares one set of in-memory servers between any number of
/// [`TestClient`]s, each a [`KeyManager`](crate::keys::KeyManager) for its
/// own device. The free functions build keyed revisions directly, for tests
/// that exercise a server without a key manager in front of it.
///
/// # Example
///
/// ```rust,ignore
/// use metadata::testkit::{device_keys, TestEnv};
///
/// #[tokio::test]
/// async fn test_share() -> anyhow::Result<()> {
///     let env = TestEnv::new();
///     let alice = env.client();
///     let bob = env.client();
///     let ctx = RequestContext::new();
///
///     // Alice creates a folder Bob can read
///     let head = alice
///         .create_folder(
///             &ctx,
///             TlfType::Private,
///             &device_keys(&[alice.device()]),
///             &device_keys(&[bob.device()]),
///         )
///         .await?;
///
///     // Bob recovers the same crypt key
///     let head = bob.head(&ctx, head.tlf_id()).await?;
///     bob.get_tlf_crypt_key(&ctx, &head, KeyGen::FIRST_VALID).await?;
///     Ok(())
/// }
/// ```
mod env;
mod fixtures;

pub use env::{TestClient, TestEnv};
pub use fixtures::{device_keys, sign, successor, KeyedFolder, TestDevice};

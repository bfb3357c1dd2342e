//! Merkle anchoring of published revisions
mod common;

use common::{no_devices, setup, shared_folder};
use metadata::context::RequestContext;
use metadata::hash::Hash;
use metadata::keys::{KeyManager, KeyManagerError, LocalDevice};
use metadata::md::Revision;
use metadata::merkle::{MerkleLeaf, MerkleTreeId, StoredMerkleLeaf};
use metadata::server::MerkleService;
use metadata::testkit::device_keys;
use metadata::tlf::TlfType;
use time::OffsetDateTime;

#[tokio::test]
async fn test_private_folder_anchor_follows_head() {
    let env = setup();
    let alice = env.client();
    let bob = env.client();
    let ctx = RequestContext::new();
    let created = shared_folder(&alice, &[&bob]).await;
    let tlf = created.tlf_id();

    assert!(alice.verify_anchor(&ctx, &created).await.unwrap());
    let (leaf, root) = env
        .merkle
        .get_leaf(&ctx, MerkleTreeId::PRIVATE, tlf)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(leaf, StoredMerkleLeaf::Encrypted(_)));
    assert_eq!(root.tree_id, MerkleTreeId::PRIVATE);

    let head = alice.commit(&ctx, tlf, |_| Ok(())).await.unwrap();
    assert!(!alice.verify_anchor(&ctx, &created).await.unwrap());
    assert!(alice.verify_anchor(&ctx, &head).await.unwrap());

    // readers hold the TLF private key too
    let head = bob.head(&ctx, tlf).await.unwrap();
    assert!(bob.verify_anchor(&ctx, &head).await.unwrap());
}

#[tokio::test]
async fn test_anchor_of_older_generation_does_not_match() {
    let env = setup();
    let alice = env.client();
    let bob = env.client();
    let ctx = RequestContext::new();
    let created = shared_folder(&alice, &[&bob]).await;

    alice
        .rekey(
            &ctx,
            created.tlf_id(),
            &device_keys(&[alice.device()]),
            &no_devices(),
        )
        .await
        .unwrap();
    assert!(!alice.verify_anchor(&ctx, &created).await.unwrap());
    let head = alice.head(&ctx, created.tlf_id()).await.unwrap();
    assert!(alice.verify_anchor(&ctx, &head).await.unwrap());
}

#[tokio::test]
async fn test_public_folder_anchor() {
    let env = setup();
    let alice = env.client();
    let ctx = RequestContext::new();
    let created = alice
        .create_folder(
            &ctx,
            TlfType::Public,
            &device_keys(&[alice.device()]),
            &no_devices(),
        )
        .await
        .unwrap();
    let first_root = env
        .merkle
        .get_root(&ctx, MerkleTreeId::PUBLIC)
        .await
        .unwrap()
        .unwrap();
    assert!(alice.verify_anchor(&ctx, &created).await.unwrap());

    let head = alice.commit(&ctx, created.tlf_id(), |_| Ok(())).await.unwrap();
    let root = env
        .merkle
        .get_root(&ctx, MerkleTreeId::PUBLIC)
        .await
        .unwrap()
        .unwrap();
    assert!(root.seqno > first_root.seqno);
    assert_ne!(root.hash, first_root.hash);
    assert!(alice.verify_anchor(&ctx, &head).await.unwrap());
    assert!(env
        .merkle
        .get_root(&ctx, MerkleTreeId::PRIVATE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_anchor_keeps_revision() {
    let env = setup();
    let alice = env.client();
    let ctx = RequestContext::new();
    let created = alice
        .create_folder(
            &ctx,
            TlfType::Public,
            &device_keys(&[alice.device()]),
            &no_devices(),
        )
        .await
        .unwrap();
    let tlf = created.tlf_id();

    // a leaf from the future makes the next submission conflict
    let future = MerkleLeaf::new(
        Revision::new(100),
        Hash::default_hash(b"elsewhere"),
        OffsetDateTime::now_utc(),
    );
    env.merkle
        .submit_leaf(&ctx, tlf, StoredMerkleLeaf::Plain(future))
        .await
        .unwrap();

    let head = alice.commit(&ctx, tlf, |_| Ok(())).await.unwrap();
    assert_eq!(head.md().revision(), Revision::new(2));
    assert_eq!(
        alice.head(&ctx, tlf).await.unwrap().md().revision(),
        Revision::new(2)
    );
    assert!(!alice.verify_anchor(&ctx, &head).await.unwrap());
}

#[tokio::test]
async fn test_verify_needs_merkle_service() {
    let env = setup();
    let alice = env.client();
    let created = shared_folder(&alice, &[]).await;
    let offline = KeyManager::new(
        LocalDevice::for_user(alice.uid()),
        env.md_server.clone(),
        env.key_server.clone(),
        env.config(),
    );
    assert!(matches!(
        offline.verify_anchor(&RequestContext::new(), &created).await,
        Err(KeyManagerError::NoMerkleService)
    ));
}

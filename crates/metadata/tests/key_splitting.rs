//! Properties of key splitting, padding and content hashes

use metadata::crypto::{
    depad_block, mask, pad_block, unmask, CryptPrivateKey, TlfCryptKey, TlfCryptKeyServerHalf,
    TlfCryptKeyServerHalfId, MIN_PADDED_BLOCK_SIZE, PAD_PREFIX_SIZE,
};
use metadata::hash::Hash;
use metadata::tlf::UserId;
use proptest::prelude::*;

proptest! {
    #[test]
    fn unmask_recovers_masked_key(
        server in any::<[u8; 32]>(),
        key in any::<[u8; 32]>(),
    ) {
        let server = TlfCryptKeyServerHalf::from_bytes(server);
        let key = TlfCryptKey::from_bytes(key);
        let client = mask(&server, &key);
        prop_assert_eq!(unmask(&server, &client), key);
    }

    #[test]
    fn client_half_reveals_neither_input(
        server in any::<[u8; 32]>(),
        key in any::<[u8; 32]>(),
    ) {
        prop_assume!(server != [0u8; 32] && key != [0u8; 32]);
        let server = TlfCryptKeyServerHalf::from_bytes(server);
        let key = TlfCryptKey::from_bytes(key);
        let client = mask(&server, &key);
        prop_assert_ne!(client.bytes(), server.bytes());
        prop_assert_ne!(client.bytes(), key.bytes());
    }

    #[test]
    fn padding_round_trips_into_power_of_two_buckets(
        data in proptest::collection::vec(any::<u8>(), 0..=4096),
    ) {
        let padded = pad_block(&data).unwrap();
        let bucket = data.len().max(MIN_PADDED_BLOCK_SIZE).next_power_of_two();
        prop_assert_eq!(padded.len(), PAD_PREFIX_SIZE + bucket);
        prop_assert_eq!(depad_block(&padded).unwrap(), data);
    }

    #[test]
    fn hash_hex_round_trips(data in proptest::collection::vec(any::<u8>(), 0..=512)) {
        let hash = Hash::default_hash(&data);
        prop_assert_eq!(Hash::from_hex(&hash.to_hex()).unwrap(), hash.clone());
        prop_assert!(hash.verify(&data).is_ok());
    }
}

#[test]
fn test_server_half_id_binds_device() {
    let uid = UserId::generate();
    let device = CryptPrivateKey::generate().public();
    let other = CryptPrivateKey::generate().public();
    let half = TlfCryptKeyServerHalf::generate();

    let id = TlfCryptKeyServerHalfId::make(&uid, &device, &half);
    assert!(id.verify(&uid, &device, &half).is_ok());
    assert!(id.verify(&uid, &other, &half).is_err());
    assert!(id.verify(&UserId::generate(), &device, &half).is_err());
    assert!(id
        .verify(&uid, &device, &TlfCryptKeyServerHalf::generate())
        .is_err());
}

#[test]
fn test_hash_rejects_other_content() {
    let hash = Hash::default_hash(b"revision");
    assert!(hash.verify(b"revision").is_ok());
    assert!(hash.verify(b"revisions").is_err());
}

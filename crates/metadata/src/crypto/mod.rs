//! Cryptographic primitives for the metadata layer
//!
//! - **Identity & Signing**: Ed25519 device signing keys, versioned
//!   [`SignatureInfo`] with an optional domain-separation prefix
//! - **Encryption**: XChaCha20-Poly1305 [`EncryptedData`] with two nonce
//!   disciplines (random, or derived from a secondary key for block payloads)
//! - **Sealing**: X25519 ECDH between a per-rekey ephemeral key and a device
//!   key, used to deliver client halves to devices
//! - **Key Splitting**: a folder's crypt key is the XOR of a server half and a
//!   client half; neither party alone can reconstruct it
//! - **Padding**: power-of-two size buckets for block payloads
//! - **Auth Tokens**: signed, time-boxed server session tokens that refresh
//!   themselves on a timer
//!
//! # Key Splitting Protocol
//!
//! On rekey, for each device that needs access:
//! 1. Generate a random server half
//! 2. `client_half = server_half XOR crypt_key`
//! 3. Seal the client half to the device's crypt public key with the rekey's
//!    ephemeral private key and store it in the key bundle
//! 4. Push the server half to the key server under
//!    `HMAC(server_half, uid || device_key)`
//!
//! A device recovers the crypt key by opening its client half, fetching the
//! server half by ID and XOR-ing the two. Revoking a device deletes its server
//! halves, so a retained client half is useless on its own.

mod auth_token;
mod keys;
mod padding;
mod secretbox;
mod signature;
mod tlf_keys;

pub use auth_token::{
    AuthToken, AuthTokenBody, AuthTokenRefreshHandler, ChallengeInfo, ClientInfo,
    AUTH_TOKEN_MIN_REFRESH_SECONDS,
};
pub use keys::{
    CryptPrivateKey, CryptPublicKey, SigningKey, TlfEphemeralPrivateKey, TlfEphemeralPublicKey,
    TlfPrivateKey, TlfPublicKey, VerifyingKey, CRYPT_KEY_SIZE, SIGNING_KEY_SIZE,
    VERIFYING_KEY_SIZE,
};
pub use padding::{depad_block, pad_block, MIN_PADDED_BLOCK_SIZE, PAD_PREFIX_SIZE};
pub use secretbox::{
    decrypt_block, decrypt_data, decrypt_data_with_key_nonce, encrypt_block, encrypt_data,
    encrypt_data_with_key_nonce, make_key_nonce, EncryptedData, EncryptionVer, NONCE_SIZE,
};
pub(crate) use secretbox::{open_sealed, seal_to};
pub use signature::{verify, SigVer, SignatureInfo, Signer, SIGNATURE_PREFIX};
pub use tlf_keys::{
    mask, unmask, EncryptedTlfCryptKeyClientHalf, EncryptedTlfCryptKeys, TlfCryptKey,
    TlfCryptKeyClientHalf, TlfCryptKeyServerHalf, TlfCryptKeyServerHalfId, TLF_CRYPT_KEY_SIZE,
};

use crate::codec::CodecError;
use crate::hash::HashError;

/// Errors that can occur in cryptographic operations
///
/// Signature, decryption and nonce failures indicate tampering or corruption
/// and are never worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("crypto error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("missing signature")]
    MissingSignature,
    #[error("unknown signature version {0}")]
    UnknownSigVer(SigVer),
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    #[error("unknown encryption version {0}")]
    UnknownEncryptionVer(EncryptionVer),
    #[error("invalid nonce length {0}")]
    InvalidNonce(usize),
    #[error("nonce does not match the one derived from its key")]
    NonceMismatch,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("padded block read error: have {actual} bytes, need {expected}")]
    PaddedBlockRead { actual: usize, expected: usize },
    #[error("server half ID mismatch")]
    ServerHalfIdMismatch,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("hash error: {0}")]
    Hash(#[from] HashError),
}

/// Fill a fixed-size array from the system CSPRNG
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buff = [0u8; N];
    getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
    buff
}

//! Versioned authenticated symmetric encryption
//!
//! Payloads are sealed with XChaCha20-Poly1305. Two nonce disciplines exist:
//!
//! - [`EncryptionVer::SECRETBOX`]: a fresh random nonce per encryption
//! - [`EncryptionVer::SECRETBOX_WITH_KEY_NONCE`]: the nonce is derived from a
//!   secondary secret key; only used for block payloads. Decryption re-derives
//!   the nonce and refuses data whose stored nonce differs, binding a block's
//!   ciphertext to its key material without any nonce bookkeeping.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::keys::diffie_hellman;
use super::padding::{depad_block, pad_block};
use super::{random_bytes, CryptoError};
use crate::hash::Hmac;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

const KEY_NONCE_LABEL: &[u8] = b"block-nonce";
const BOX_KEY_LABEL: &[u8] = b"TLF-Metadata-box";

/// Encryption scheme version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionVer(u8);

impl EncryptionVer {
    /// Random nonce
    pub const SECRETBOX: EncryptionVer = EncryptionVer(1);
    /// Nonce derived from a secondary key
    pub const SECRETBOX_WITH_KEY_NONCE: EncryptionVer = EncryptionVer(2);

    pub fn from_u8(value: u8) -> Self {
        EncryptionVer(value)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn is_known(&self) -> bool {
        matches!(
            *self,
            EncryptionVer::SECRETBOX | EncryptionVer::SECRETBOX_WITH_KEY_NONCE
        )
    }
}

impl fmt::Display for EncryptionVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ciphertext plus the parameters needed to open it
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub version: EncryptionVer,
    #[serde_as(as = "Bytes")]
    pub encrypted_data: Vec<u8>,
    #[serde_as(as = "Bytes")]
    pub nonce: Vec<u8>,
}

impl EncryptedData {
    fn nonce_array(&self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        self.nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidNonce(self.nonce.len()))
    }
}

fn seal(
    plaintext: &[u8],
    key: &[u8; 32],
    nonce: [u8; NONCE_SIZE],
    version: EncryptionVer,
) -> Result<EncryptedData, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let encrypted_data = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(EncryptedData {
        version,
        encrypted_data,
        nonce: nonce.to_vec(),
    })
}

fn open(encrypted: &EncryptedData, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let nonce = encrypted.nonce_array()?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(&nonce), encrypted.encrypted_data.as_ref())
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt with a fresh random nonce
pub fn encrypt_data(plaintext: &[u8], key: &[u8; 32]) -> Result<EncryptedData, CryptoError> {
    seal(plaintext, key, random_bytes(), EncryptionVer::SECRETBOX)
}

/// Decrypt data produced by [`encrypt_data`]
pub fn decrypt_data(encrypted: &EncryptedData, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    match encrypted.version {
        EncryptionVer::SECRETBOX => open(encrypted, key),
        EncryptionVer::SECRETBOX_WITH_KEY_NONCE => Err(anyhow::anyhow!(
            "key-nonce data can only be opened together with its nonce key"
        )
        .into()),
        other => Err(CryptoError::UnknownEncryptionVer(other)),
    }
}

/// Derive the deterministic nonce bound to `nonce_key`
pub fn make_key_nonce(nonce_key: &[u8; 32]) -> [u8; NONCE_SIZE] {
    let mac = Hmac::default_hmac(nonce_key, KEY_NONCE_LABEL);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&mac.hash().digest_bytes()[..NONCE_SIZE]);
    nonce
}

/// Encrypt with a nonce derived from `nonce_key`
pub fn encrypt_data_with_key_nonce(
    plaintext: &[u8],
    key: &[u8; 32],
    nonce_key: &[u8; 32],
) -> Result<EncryptedData, CryptoError> {
    seal(
        plaintext,
        key,
        make_key_nonce(nonce_key),
        EncryptionVer::SECRETBOX_WITH_KEY_NONCE,
    )
}

/// Decrypt key-nonce data, first checking the stored nonce is the derived one
pub fn decrypt_data_with_key_nonce(
    encrypted: &EncryptedData,
    key: &[u8; 32],
    nonce_key: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    match encrypted.version {
        EncryptionVer::SECRETBOX_WITH_KEY_NONCE => {
            if encrypted.nonce_array()? != make_key_nonce(nonce_key) {
                return Err(CryptoError::NonceMismatch);
            }
            open(encrypted, key)
        }
        EncryptionVer::SECRETBOX => open(encrypted, key),
        other => Err(CryptoError::UnknownEncryptionVer(other)),
    }
}

/// Pad and encrypt a block payload
pub fn encrypt_block(
    plaintext: &[u8],
    key: &[u8; 32],
    nonce_key: &[u8; 32],
) -> Result<EncryptedData, CryptoError> {
    let padded = pad_block(plaintext)?;
    encrypt_data_with_key_nonce(&padded, key, nonce_key)
}

/// Decrypt and depad a block payload
pub fn decrypt_block(
    encrypted: &EncryptedData,
    key: &[u8; 32],
    nonce_key: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let padded = decrypt_data_with_key_nonce(encrypted, key, nonce_key)?;
    depad_block(&padded)
}

fn box_key(shared: &[u8; 32], ephemeral: &X25519PublicKey, recipient: &X25519PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(BOX_KEY_LABEL);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

/// Seal `plaintext` to `recipient` using an ephemeral private key
pub(crate) fn seal_to(
    plaintext: &[u8],
    recipient: &X25519PublicKey,
    ephemeral: &StaticSecret,
) -> Result<EncryptedData, CryptoError> {
    let shared = diffie_hellman(ephemeral, recipient);
    let ephemeral_public = X25519PublicKey::from(ephemeral);
    encrypt_data(plaintext, &box_key(&shared, &ephemeral_public, recipient))
}

/// Open data sealed with [`seal_to`]
pub(crate) fn open_sealed(
    encrypted: &EncryptedData,
    recipient: &StaticSecret,
    ephemeral_public: &X25519PublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let shared = diffie_hellman(recipient, ephemeral_public);
    let recipient_public = X25519PublicKey::from(recipient);
    decrypt_data(
        encrypted,
        &box_key(&shared, ephemeral_public, &recipient_public),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = random_bytes::<32>();
        let data = b"private metadata";

        let encrypted = encrypt_data(data, &key).unwrap();
        assert_eq!(encrypted.version, EncryptionVer::SECRETBOX);
        assert_eq!(encrypted.nonce.len(), NONCE_SIZE);
        assert_eq!(decrypt_data(&encrypted, &key).unwrap(), data.to_vec());

        // random nonces
        let again = encrypt_data(data, &key).unwrap();
        assert_ne!(encrypted.nonce, again.nonce);
    }

    #[test]
    fn test_tampering_detected() {
        let key = random_bytes::<32>();
        let mut encrypted = encrypt_data(b"do not touch", &key).unwrap();
        encrypted.encrypted_data[0] ^= 0xff;
        assert!(matches!(
            decrypt_data(&encrypted, &key),
            Err(CryptoError::Decryption)
        ));

        let other = random_bytes::<32>();
        let encrypted = encrypt_data(b"do not touch", &key).unwrap();
        assert!(decrypt_data(&encrypted, &other).is_err());
    }

    #[test]
    fn test_unknown_version() {
        let key = random_bytes::<32>();
        let mut encrypted = encrypt_data(b"x", &key).unwrap();
        encrypted.version = EncryptionVer::from_u8(42);
        assert!(matches!(
            decrypt_data(&encrypted, &key),
            Err(CryptoError::UnknownEncryptionVer(_))
        ));
    }

    #[test]
    fn test_key_nonce_binding() {
        let key = random_bytes::<32>();
        let nonce_key = random_bytes::<32>();
        let data = b"block contents";

        let encrypted = encrypt_data_with_key_nonce(data, &key, &nonce_key).unwrap();
        assert_eq!(encrypted.version, EncryptionVer::SECRETBOX_WITH_KEY_NONCE);
        assert_eq!(encrypted.nonce, make_key_nonce(&nonce_key).to_vec());
        assert_eq!(
            decrypt_data_with_key_nonce(&encrypted, &key, &nonce_key).unwrap(),
            data.to_vec()
        );

        // deterministic
        let again = encrypt_data_with_key_nonce(data, &key, &nonce_key).unwrap();
        assert_eq!(encrypted, again);

        // a different nonce key is refused before decryption is attempted
        let wrong = random_bytes::<32>();
        assert!(matches!(
            decrypt_data_with_key_nonce(&encrypted, &key, &wrong),
            Err(CryptoError::NonceMismatch)
        ));

        // the plain path refuses key-nonce data
        assert!(decrypt_data(&encrypted, &key).is_err());
    }

    #[test]
    fn test_block_round_trip_hides_length() {
        let key = random_bytes::<32>();
        let nonce_key = random_bytes::<32>();
        let small = encrypt_block(b"a", &key, &nonce_key).unwrap();
        let larger = encrypt_block(&[7u8; 200], &key, &nonce_key).unwrap();
        assert_eq!(small.encrypted_data.len(), larger.encrypted_data.len());
        assert_eq!(decrypt_block(&small, &key, &nonce_key).unwrap(), b"a".to_vec());
        assert_eq!(
            decrypt_block(&larger, &key, &nonce_key).unwrap(),
            vec![7u8; 200]
        );
    }

    #[test]
    fn test_seal_open() {
        let recipient = StaticSecret::from(random_bytes::<32>());
        let recipient_public = X25519PublicKey::from(&recipient);
        let ephemeral = StaticSecret::from(random_bytes::<32>());
        let ephemeral_public = X25519PublicKey::from(&ephemeral);

        let sealed = seal_to(b"client half", &recipient_public, &ephemeral).unwrap();
        let opened = open_sealed(&sealed, &recipient, &ephemeral_public).unwrap();
        assert_eq!(opened, b"client half".to_vec());

        let stranger = StaticSecret::from(random_bytes::<32>());
        assert!(open_sealed(&sealed, &stranger, &ephemeral_public).is_err());
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use super::keys::{
    CryptPrivateKey, CryptPublicKey, TlfEphemeralPrivateKey, TlfEphemeralPublicKey,
};
use super::secretbox::{decrypt_data, encrypt_data, open_sealed, seal_to, EncryptedData};
use super::{random_bytes, CryptoError};
use crate::codec;
use crate::hash::Hmac;
use crate::tlf::UserId;

/// Size of a folder crypt key and of each of its halves
pub const TLF_CRYPT_KEY_SIZE: usize = 32;

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[serde_as]
        #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(#[serde_as(as = "Bytes")] [u8; TLF_CRYPT_KEY_SIZE]);

        impl $name {
            pub fn generate() -> Self {
                Self(random_bytes())
            }

            pub fn from_bytes(bytes: [u8; TLF_CRYPT_KEY_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(&self) -> [u8; TLF_CRYPT_KEY_SIZE] {
                self.0
            }

            pub fn bytes(&self) -> &[u8; TLF_CRYPT_KEY_SIZE] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// The symmetric key protecting one key generation of a folder.
    /// Never stored; rebuilt from its two halves on demand.
    TlfCryptKey
);

secret_key!(
    /// The half of a crypt key held by the key server, per device
    TlfCryptKeyServerHalf
);

secret_key!(
    /// The half of a crypt key sealed to a device inside a key bundle
    TlfCryptKeyClientHalf
);

fn xor(a: &[u8; TLF_CRYPT_KEY_SIZE], b: &[u8; TLF_CRYPT_KEY_SIZE]) -> [u8; TLF_CRYPT_KEY_SIZE] {
    let mut out = [0u8; TLF_CRYPT_KEY_SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Derive the client half that pairs with `server_half` to give `key`
pub fn mask(server_half: &TlfCryptKeyServerHalf, key: &TlfCryptKey) -> TlfCryptKeyClientHalf {
    TlfCryptKeyClientHalf(xor(&server_half.0, &key.0))
}

/// Recombine the two halves into the crypt key
pub fn unmask(
    server_half: &TlfCryptKeyServerHalf,
    client_half: &TlfCryptKeyClientHalf,
) -> TlfCryptKey {
    TlfCryptKey(xor(&server_half.0, &client_half.0))
}

/// Identifies a server half to the key server without revealing it.
///
/// `HMAC-SHA256(key = server_half, msg = uid || device_crypt_public_key)`
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TlfCryptKeyServerHalfId(Hmac);

fn server_half_id_message(uid: &UserId, device: &CryptPublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(uid.bytes().len() + TLF_CRYPT_KEY_SIZE);
    msg.extend_from_slice(uid.bytes());
    msg.extend_from_slice(&device.to_bytes());
    msg
}

impl TlfCryptKeyServerHalfId {
    pub fn make(
        uid: &UserId,
        device: &CryptPublicKey,
        server_half: &TlfCryptKeyServerHalf,
    ) -> Self {
        TlfCryptKeyServerHalfId(Hmac::default_hmac(
            server_half.bytes(),
            &server_half_id_message(uid, device),
        ))
    }

    /// Check that `server_half` is the half this ID names for `(uid, device)`
    pub fn verify(
        &self,
        uid: &UserId,
        device: &CryptPublicKey,
        server_half: &TlfCryptKeyServerHalf,
    ) -> Result<(), CryptoError> {
        self.0
            .verify(server_half.bytes(), &server_half_id_message(uid, device))
            .map_err(|_| CryptoError::ServerHalfIdMismatch)
    }

    pub fn hmac(&self) -> &Hmac {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for TlfCryptKeyServerHalfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TlfCryptKeyServerHalfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfCryptKeyServerHalfId({})", self.0)
    }
}

/// A client half sealed to one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedTlfCryptKeyClientHalf(EncryptedData);

impl EncryptedTlfCryptKeyClientHalf {
    pub fn seal(
        client_half: &TlfCryptKeyClientHalf,
        device: &CryptPublicKey,
        ephemeral: &TlfEphemeralPrivateKey,
    ) -> Result<Self, CryptoError> {
        Ok(EncryptedTlfCryptKeyClientHalf(seal_to(
            client_half.bytes(),
            &device.to_x25519(),
            &ephemeral.to_x25519(),
        )?))
    }

    pub fn open(
        &self,
        device: &CryptPrivateKey,
        ephemeral: &TlfEphemeralPublicKey,
    ) -> Result<TlfCryptKeyClientHalf, CryptoError> {
        let plain = open_sealed(&self.0, &device.to_x25519(), &ephemeral.to_x25519())?;
        let bytes: [u8; TLF_CRYPT_KEY_SIZE] = plain
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("client half has {} bytes", plain.len())))?;
        Ok(TlfCryptKeyClientHalf(bytes))
    }

    pub fn data(&self) -> &EncryptedData {
        &self.0
    }
}

/// Every earlier generation's crypt key, encrypted with the current one.
///
/// Lets a device that can read the latest generation recover all history
/// without per-generation bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedTlfCryptKeys(EncryptedData);

impl EncryptedTlfCryptKeys {
    pub fn encrypt(keys: &[TlfCryptKey], current: &TlfCryptKey) -> Result<Self, CryptoError> {
        let encoded = codec::encode(&keys.to_vec())?;
        Ok(EncryptedTlfCryptKeys(encrypt_data(&encoded, current.bytes())?))
    }

    pub fn decrypt(&self, current: &TlfCryptKey) -> Result<Vec<TlfCryptKey>, CryptoError> {
        let encoded = decrypt_data(&self.0, current.bytes())?;
        Ok(codec::decode(&encoded)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.encrypted_data.is_empty()
    }
}

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::Signer as _;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::{random_bytes, CryptoError};

/// Size of Ed25519 private key in bytes
pub const SIGNING_KEY_SIZE: usize = 32;
/// Size of Ed25519 public key in bytes
pub const VERIFYING_KEY_SIZE: usize = 32;
/// Size of an X25519 key (public or private) in bytes
pub const CRYPT_KEY_SIZE: usize = 32;

fn parse_hex_array<const N: usize>(hex_str: &str, what: &str) -> Result<[u8; N], CryptoError> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let mut buff = [0; N];
    hex::decode_to_slice(hex_str, &mut buff)
        .map_err(|_| anyhow::anyhow!("{} hex decode error", what))?;
    Ok(buff)
}

/// Device signing key
///
/// Signs root metadata (as last modifier), writer metadata (as last writer)
/// and authentication tokens. Never leaves the device.
#[derive(Clone)]
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    /// Generate a new random signing key using a cryptographically secure RNG
    pub fn generate() -> Self {
        Self::from_bytes(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    /// Parse a signing key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_bytes(parse_hex_array(hex, "signing key")?))
    }

    pub fn to_bytes(&self) -> [u8; SIGNING_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Derive the verifying key for this signing key
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key().to_bytes())
    }

    /// Produce a raw Ed25519 signature over `msg`
    pub(crate) fn sign_raw(&self, msg: &[u8]) -> [u8; 64] {
        self.0.sign(msg).to_bytes()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningKey")
            .field(&self.verifying_key())
            .finish()
    }
}

/// Public half of a device signing key
///
/// Kept as raw bytes so that structures carrying a not-yet-validated key
/// (e.g. an unsigned `SignatureInfo`) still decode; the point is checked
/// when the key is actually used.
#[serde_as]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerifyingKey(#[serde_as(as = "Bytes")] [u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        Ok(Self(parse_hex_array(hex, "verifying key")?))
    }

    pub fn to_bytes(&self) -> [u8; VERIFYING_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; VERIFYING_KEY_SIZE]
    }

    pub(crate) fn to_dalek(self) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(format!("verifying key: {}", e)))
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({})", self.to_hex())
    }
}

impl FromStr for VerifyingKey {
    type Err = CryptoError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Defines an X25519 public/private key pair of newtypes.
///
/// The metadata layer uses three distinct X25519 roles (device keys,
/// per-rekey ephemeral keys and per-generation TLF keys); keeping them as
/// separate types stops one from being passed where another is expected.
macro_rules! x25519_key_pair {
    ($(#[$pub_meta:meta])* $public:ident, $(#[$priv_meta:meta])* $private:ident) => {
        $(#[$pub_meta])*
        #[serde_as]
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $public(#[serde_as(as = "Bytes")] [u8; CRYPT_KEY_SIZE]);

        impl $public {
            pub fn from_bytes(bytes: [u8; CRYPT_KEY_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
                Ok(Self(parse_hex_array(hex, stringify!($public))?))
            }

            pub fn to_bytes(&self) -> [u8; CRYPT_KEY_SIZE] {
                self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub(crate) fn to_x25519(self) -> X25519PublicKey {
                X25519PublicKey::from(self.0)
            }
        }

        impl fmt::Display for $public {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $public {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($public), self.to_hex())
            }
        }

        impl FromStr for $public {
            type Err = CryptoError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        $(#[$priv_meta])*
        #[serde_as]
        #[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $private(#[serde_as(as = "Bytes")] [u8; CRYPT_KEY_SIZE]);

        impl $private {
            pub fn generate() -> Self {
                Self(random_bytes())
            }

            pub fn from_bytes(bytes: [u8; CRYPT_KEY_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(&self) -> [u8; CRYPT_KEY_SIZE] {
                self.0
            }

            pub fn public(&self) -> $public {
                $public(X25519PublicKey::from(&self.to_x25519()).to_bytes())
            }

            pub(crate) fn to_x25519(&self) -> StaticSecret {
                StaticSecret::from(self.0)
            }
        }

        impl fmt::Debug for $private {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($private))
                    .field(&"[REDACTED]")
                    .finish()
            }
        }
    };
}

x25519_key_pair!(
    /// Public half of a device's encryption key; bundles are keyed by it
    CryptPublicKey,
    /// Private half of a device's encryption key
    CryptPrivateKey
);

x25519_key_pair!(
    /// Public half of a per-rekey ephemeral keypair, stored in the key bundle
    TlfEphemeralPublicKey,
    /// Private half of a per-rekey ephemeral keypair, discarded after the rekey
    TlfEphemeralPrivateKey
);

x25519_key_pair!(
    /// Per-generation folder public key (used to seal Merkle leaves)
    TlfPublicKey,
    /// Per-generation folder private key, kept inside private metadata
    TlfPrivateKey
);

/// Perform X25519 Diffie-Hellman between a private scalar and a public point
pub(crate) fn diffie_hellman(private: &StaticSecret, public: &X25519PublicKey) -> [u8; 32] {
    *private.diffie_hellman(public).as_bytes()
}

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use super::keys::{SigningKey, VerifyingKey};
use super::CryptoError;

/// Domain separation prefix for [`SigVer::ED25519_PREFIXED`] signatures.
///
/// The signed message is `prefix || 0x00 || msg`, so a signature made for
/// metadata can never be replayed as a signature over some other protocol's
/// message that happens to share the same bytes.
pub const SIGNATURE_PREFIX: &[u8] = b"TLF-Metadata-Ed25519";

const ED25519_SIGNATURE_SIZE: usize = 64;

/// Signature scheme version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigVer(u8);

impl SigVer {
    /// Plain Ed25519 over the message
    pub const ED25519: SigVer = SigVer(1);
    /// Ed25519 over the domain-separated message
    pub const ED25519_PREFIXED: SigVer = SigVer(2);

    pub fn from_u8(value: u8) -> Self {
        SigVer(value)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn is_known(&self) -> bool {
        matches!(*self, SigVer::ED25519 | SigVer::ED25519_PREFIXED)
    }
}

impl fmt::Display for SigVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A detached signature together with everything needed to check it
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub version: SigVer,
    #[serde_as(as = "Bytes")]
    pub signature: Vec<u8>,
    pub verifying_key: VerifyingKey,
}

impl SignatureInfo {
    /// A nil signature cannot possibly verify
    pub fn is_nil(&self) -> bool {
        self.signature.is_empty()
    }
}

impl fmt::Display for SignatureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{version: {}, signature: {}, key: {}}}",
            self.version,
            hex::encode(&self.signature),
            self.verifying_key
        )
    }
}

fn prefixed_message(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNATURE_PREFIX.len() + 1 + msg.len());
    out.extend_from_slice(SIGNATURE_PREFIX);
    out.push(0);
    out.extend_from_slice(msg);
    out
}

/// Something that can sign on behalf of a device
pub trait Signer: Send + Sync {
    fn verifying_key(&self) -> VerifyingKey;

    /// Plain signature over `msg`
    fn sign(&self, msg: &[u8]) -> SignatureInfo;

    /// Domain-separated signature over `msg`
    fn sign_prefixed(&self, msg: &[u8]) -> SignatureInfo;
}

impl Signer for SigningKey {
    fn verifying_key(&self) -> VerifyingKey {
        SigningKey::verifying_key(self)
    }

    fn sign(&self, msg: &[u8]) -> SignatureInfo {
        SignatureInfo {
            version: SigVer::ED25519,
            signature: self.sign_raw(msg).to_vec(),
            verifying_key: SigningKey::verifying_key(self),
        }
    }

    fn sign_prefixed(&self, msg: &[u8]) -> SignatureInfo {
        SignatureInfo {
            version: SigVer::ED25519_PREFIXED,
            signature: self.sign_raw(&prefixed_message(msg)).to_vec(),
            verifying_key: SigningKey::verifying_key(self),
        }
    }
}

/// Verify `sig_info` over `msg`.
///
/// Unknown versions are rejected before any curve arithmetic happens.
pub fn verify(msg: &[u8], sig_info: &SignatureInfo) -> Result<(), CryptoError> {
    if sig_info.is_nil() {
        return Err(CryptoError::MissingSignature);
    }
    let message: Cow<'_, [u8]> = match sig_info.version {
        SigVer::ED25519 => Cow::Borrowed(msg),
        SigVer::ED25519_PREFIXED => Cow::Owned(prefixed_message(msg)),
        other => return Err(CryptoError::UnknownSigVer(other)),
    };
    let signature: [u8; ED25519_SIGNATURE_SIZE] = sig_info
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| {
            CryptoError::BadSignature(format!(
                "signature has {} bytes, expected {}",
                sig_info.signature.len(),
                ED25519_SIGNATURE_SIZE
            ))
        })?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    sig_info
        .verifying_key
        .to_dalek()?
        .verify_strict(&message, &signature)
        .map_err(|e| CryptoError::BadSignature(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::generate();
        let message = b"hello, world!";

        let sig = key.sign(message);
        assert_eq!(sig.version, SigVer::ED25519);
        assert!(verify(message, &sig).is_ok());
        assert!(verify(b"hello, world?", &sig).is_err());

        // wrong key
        let mut other = sig.clone();
        other.verifying_key = SigningKey::generate().verifying_key();
        assert!(verify(message, &other).is_err());
    }

    #[test]
    fn test_prefixed_signatures_are_domain_separated() {
        let key = SigningKey::generate();
        let message = b"root metadata";

        let sig = key.sign_prefixed(message);
        assert!(verify(message, &sig).is_ok());

        // The same bytes presented as a plain signature must not verify
        let mut as_plain = sig.clone();
        as_plain.version = SigVer::ED25519;
        assert!(verify(message, &as_plain).is_err());

        // And a plain signature must not pass as prefixed
        let mut plain = key.sign(message);
        plain.version = SigVer::ED25519_PREFIXED;
        assert!(verify(message, &plain).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let key = SigningKey::generate();
        let mut sig = key.sign(b"msg");
        sig.version = SigVer::from_u8(9);
        assert!(matches!(
            verify(b"msg", &sig),
            Err(CryptoError::UnknownSigVer(v)) if v.as_u8() == 9
        ));
    }

    #[test]
    fn test_nil_signature() {
        let sig = SignatureInfo::default();
        assert!(sig.is_nil());
        assert!(matches!(
            verify(b"msg", &sig),
            Err(CryptoError::MissingSignature)
        ));
    }
}

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::codec::{self, UnknownFields};
use crate::crypto::{verify, CryptoError, SignatureInfo, Signer, VerifyingKey};
use crate::hash::Hash;
use crate::tlf::{HandleExtension, UserId};

use super::errors::MdError;
use super::key_bundle_v3::ExtraMetadataV3;
use super::root_metadata::RootMetadata;
use super::types::{MetadataFlags, MetadataId, MetadataVer};

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SignedWire {
    version: MetadataVer,
    #[serde_as(as = "Bytes")]
    md: Vec<u8>,
    sig_info: SignatureInfo,
    writer_sig_info: SignatureInfo,
    #[serde(flatten)]
    unknown: UnknownFields,
}

/// A revision together with its root signature (by the last modifying
/// user's device) and writer signature (by the last writer's device).
///
/// This is the unit exchanged with the metadata server.
#[derive(Debug, Clone, PartialEq)]
pub struct RootMetadataSigned {
    md: RootMetadata,
    sig_info: SignatureInfo,
    writer_sig_info: SignatureInfo,
    unknown: UnknownFields,
}

impl RootMetadataSigned {
    /// Sign `md` with `signer`.
    ///
    /// If the writer metadata was copied from the predecessor, its writer
    /// signature is reused from `prev_writer_sig` instead of being made
    /// afresh.
    pub fn sign(
        md: RootMetadata,
        signer: &dyn Signer,
        prev_writer_sig: Option<&SignatureInfo>,
    ) -> Result<Self, MdError> {
        let writer_sig_info = if md.is_writer_metadata_copied_set() {
            prev_writer_sig
                .cloned()
                .ok_or_else(|| MdError::Invalid("copied writer metadata needs the previous writer signature".to_string()))?
        } else {
            signer.sign(&md.writer_metadata_bytes()?)
        };
        let sig_info = signer.sign_prefixed(&md.encode()?);
        tracing::debug!(
            "signed revision {} of folder {} as {}",
            md.revision(),
            md.tlf_id(),
            sig_info.verifying_key
        );
        Ok(RootMetadataSigned {
            md,
            sig_info,
            writer_sig_info,
            unknown: UnknownFields::new(),
        })
    }

    pub fn from_parts(md: RootMetadata, sig_info: SignatureInfo, writer_sig_info: SignatureInfo) -> Self {
        RootMetadataSigned {
            md,
            sig_info,
            writer_sig_info,
            unknown: UnknownFields::new(),
        }
    }

    pub fn md(&self) -> &RootMetadata {
        &self.md
    }

    pub fn into_md(self) -> RootMetadata {
        self.md
    }

    pub fn sig_info(&self) -> &SignatureInfo {
        &self.sig_info
    }

    pub fn writer_sig_info(&self) -> &SignatureInfo {
        &self.writer_sig_info
    }

    pub fn version(&self) -> MetadataVer {
        self.md.version()
    }

    pub fn md_id(&self) -> Result<MetadataId, MdError> {
        self.md.id()
    }

    /// Hash of the whole envelope, as anchored in the Merkle tree
    pub fn hash(&self) -> Result<Hash, MdError> {
        Ok(Hash::default_hash(&self.encode()?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, MdError> {
        let wire = SignedWire {
            version: self.md.version(),
            md: self.md.encode()?,
            sig_info: self.sig_info.clone(),
            writer_sig_info: self.writer_sig_info.clone(),
            unknown: self.unknown.clone(),
        };
        Ok(codec::encode(&wire)?)
    }

    pub fn decode(data: &[u8], min_version: MetadataVer) -> Result<Self, MdError> {
        let wire: SignedWire = codec::decode(data)?;
        let md = RootMetadata::decode(&wire.md, min_version)?;
        if md.version() != wire.version {
            return Err(MdError::VersionMismatch {
                envelope: wire.version,
                md: md.version(),
            });
        }
        Ok(RootMetadataSigned {
            md,
            sig_info: wire.sig_info,
            writer_sig_info: wire.writer_sig_info,
            unknown: wire.unknown,
        })
    }

    /// The revisions the root signature may have been made over.
    ///
    /// A final copy is signed with the signature of the revision it
    /// finalizes, so the finalization changes are masked back out. Whether
    /// the original already had its writer metadata copied is not
    /// recorded, so both forms are candidates.
    fn signed_candidates(&self) -> Vec<RootMetadata> {
        if !self.md.is_final() {
            return vec![self.md.clone()];
        }
        let mut masked = self.md.clone();
        masked.clear_flag(MetadataFlags::FINAL);
        masked.set_revision(self.md.revision().prev());
        masked.set_finalized_info(None);
        let copied = masked.clone();
        masked.clear_flag(MetadataFlags::WRITER_METADATA_COPIED);
        vec![masked, copied]
    }

    /// Check structure and both signatures of an untrusted envelope
    pub fn is_valid_and_signed(&self, extra: Option<&ExtraMetadataV3>) -> Result<(), MdError> {
        if self.sig_info.is_nil() || self.writer_sig_info.is_nil() {
            return Err(CryptoError::MissingSignature.into());
        }
        if self.md.is_final() && !self.md.is_writer_metadata_copied_set() {
            return Err(MdError::Invalid(
                "final revision without copied writer metadata".to_string(),
            ));
        }
        self.md.is_valid(extra)?;

        let mut result = Err(CryptoError::MissingSignature);
        for candidate in self.signed_candidates() {
            result = verify(&candidate.encode()?, &self.sig_info);
            if result.is_ok() {
                break;
            }
        }
        result?;

        verify(&self.md.writer_metadata_bytes()?, &self.writer_sig_info)?;
        Ok(())
    }

    /// Check that `uid` using `key` made this revision. The writer side is
    /// only checked when the writer metadata was not copied.
    pub fn is_last_modified_by(&self, uid: &UserId, key: &VerifyingKey) -> Result<(), MdError> {
        if !self.md.is_writer_metadata_copied_set() {
            let writer = self.md.last_modifying_writer();
            if writer != *uid {
                return Err(MdError::LastModifierMismatch(format!(
                    "last writer {} is not {}",
                    writer, uid
                )));
            }
            if self.writer_sig_info.verifying_key != *key {
                return Err(MdError::LastModifierMismatch(format!(
                    "writer signed with {}, expected {}",
                    self.writer_sig_info.verifying_key, key
                )));
            }
        }

        let user = self.md.last_modifying_user();
        if user != *uid {
            return Err(MdError::LastModifierMismatch(format!(
                "last modifier {} is not {}",
                user, uid
            )));
        }
        if self.sig_info.verifying_key != *key {
            return Err(MdError::LastModifierMismatch(format!(
                "root signed with {}, expected {}",
                self.sig_info.verifying_key, key
            )));
        }
        Ok(())
    }

    /// The terminal revision of a folder that is being reset.
    ///
    /// Both signatures carry over unchanged; only the final and copied
    /// flags, the revision and the finalization record differ.
    pub fn make_final_copy(&self, finalized_info: HandleExtension) -> Result<Self, MdError> {
        if self.md.is_final() {
            return Err(MdError::MetadataIsFinal(self.md.revision()));
        }
        let mut md = self.md.clone();
        md.set_flag(MetadataFlags::FINAL);
        md.set_flag(MetadataFlags::WRITER_METADATA_COPIED);
        md.set_revision(
            self.md
                .revision()
                .checked_next()
                .ok_or(MdError::RevisionOverflow(self.md.revision()))?,
        );
        md.set_finalized_info(Some(finalized_info));
        tracing::info!("finalized folder {} at revision {}", md.tlf_id(), md.revision());
        Ok(RootMetadataSigned {
            md,
            sig_info: self.sig_info.clone(),
            writer_sig_info: self.writer_sig_info.clone(),
            unknown: self.unknown.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use time::OffsetDateTime;

    use super::*;
    use crate::crypto::{CryptPrivateKey, SigningKey, TlfCryptKey, TlfEphemeralPrivateKey, TlfPrivateKey};
    use crate::md::key_bundle::UserDevicePublicKeys;
    use crate::md::types::Revision;
    use crate::tlf::{TlfHandle, TlfId, TlfType};

    struct Fixture {
        rmds: RootMetadataSigned,
        extra: Option<ExtraMetadataV3>,
        alice: UserId,
        key: SigningKey,
    }

    fn signed(version: MetadataVer) -> Fixture {
        let alice = UserId::generate();
        let key = SigningKey::generate();
        let mut md = RootMetadata::make_initial(
            version,
            TlfId::generate(TlfType::Private),
            &TlfHandle::default(),
        )
        .unwrap();
        let (extra, _) = md
            .add_key_generation(
                None,
                None,
                &UserDevicePublicKeys::from([(alice, BTreeSet::from([CryptPrivateKey::generate().public()]))]),
                &UserDevicePublicKeys::new(),
                &TlfEphemeralPrivateKey::generate(),
                TlfPrivateKey::generate().public(),
                &TlfCryptKey::generate(),
            )
            .unwrap();
        md.set_last_modifying_writer(alice);
        md.set_last_modifying_user(alice);
        Fixture {
            rmds: RootMetadataSigned::sign(md, &key, None).unwrap(),
            extra,
            alice,
            key,
        }
    }

    #[test]
    fn test_sign_and_verify() {
        for version in [MetadataVer::INITIAL_EXTRA, MetadataVer::SEGREGATED_KEY_BUNDLES] {
            let f = signed(version);
            f.rmds.is_valid_and_signed(f.extra.as_ref()).unwrap();
            f.rmds.is_last_modified_by(&f.alice, &f.key.verifying_key()).unwrap();
            assert!(matches!(
                f.rmds.is_last_modified_by(&f.alice, &SigningKey::generate().verifying_key()),
                Err(MdError::LastModifierMismatch(_))
            ));
            assert!(f
                .rmds
                .is_last_modified_by(&UserId::generate(), &f.key.verifying_key())
                .is_err());
        }
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let f = signed(MetadataVer::SEGREGATED_KEY_BUNDLES);

        let mut md = f.rmds.md().clone();
        md.set_disk_usage(1);
        let tampered = RootMetadataSigned::from_parts(
            md,
            f.rmds.sig_info().clone(),
            f.rmds.writer_sig_info().clone(),
        );
        assert!(tampered.is_valid_and_signed(f.extra.as_ref()).is_err());

        // flip the last byte of the encoded metadata inside the envelope
        let mut wire: SignedWire = codec::decode(&f.rmds.encode().unwrap()).unwrap();
        if let Some(byte) = wire.md.last_mut() {
            *byte ^= 0x01;
        }
        let bytes = codec::encode(&wire).unwrap();
        let result = RootMetadataSigned::decode(&bytes, MetadataVer::FIRST_VALID)
            .and_then(|rmds| rmds.is_valid_and_signed(f.extra.as_ref()));
        assert!(result.is_err());

        let unsigned = RootMetadataSigned::from_parts(
            f.rmds.md().clone(),
            SignatureInfo::default(),
            f.rmds.writer_sig_info().clone(),
        );
        assert!(matches!(
            unsigned.is_valid_and_signed(f.extra.as_ref()),
            Err(MdError::Crypto(CryptoError::MissingSignature))
        ));
    }

    #[test]
    fn test_final_copy_verifies_masked() {
        let f = signed(MetadataVer::SEGREGATED_KEY_BUNDLES);
        let now = OffsetDateTime::now_utc();
        let fin = f
            .rmds
            .make_final_copy(HandleExtension::new_finalized(1, None, now))
            .unwrap();
        assert!(fin.md().is_final());
        assert_eq!(fin.md().revision(), Revision::new(2));
        assert_eq!(fin.md().prev_root(), f.rmds.md().prev_root());
        fin.is_valid_and_signed(f.extra.as_ref()).unwrap();

        let id = f.rmds.md_id().unwrap();
        f.rmds.md().check_valid_successor(&id, fin.md()).unwrap();
        assert!(matches!(
            fin.make_final_copy(HandleExtension::new_finalized(2, None, now)),
            Err(MdError::MetadataIsFinal(_))
        ));

        // the finalization record itself is not covered
        let mut md = fin.md().clone();
        md.set_finalized_info(Some(HandleExtension::new_finalized(3, None, now)));
        let changed = RootMetadataSigned::from_parts(md, fin.sig_info().clone(), fin.writer_sig_info().clone());
        changed.is_valid_and_signed(f.extra.as_ref()).unwrap();

        // anything else is
        let mut md = fin.md().clone();
        md.add_md_ref_bytes(1).unwrap();
        let changed = RootMetadataSigned::from_parts(md, fin.sig_info().clone(), fin.writer_sig_info().clone());
        assert!(changed.is_valid_and_signed(f.extra.as_ref()).is_err());

        let mut md = fin.md().clone();
        md.set_revision(Revision::new(5));
        let changed = RootMetadataSigned::from_parts(md, fin.sig_info().clone(), fin.writer_sig_info().clone());
        assert!(changed.is_valid_and_signed(f.extra.as_ref()).is_err());
    }

    #[test]
    fn test_copied_writer_metadata_reuses_writer_signature() {
        let f = signed(MetadataVer::INITIAL_EXTRA);
        let id = f.rmds.md_id().unwrap();
        let (mut next, _) = f
            .rmds
            .md()
            .make_successor_copy(&id, None, MetadataVer::INITIAL_EXTRA, &[], false)
            .unwrap();
        next.set_flag(MetadataFlags::WRITER_METADATA_COPIED);

        let reader_key = SigningKey::generate();
        assert!(RootMetadataSigned::sign(next.clone(), &reader_key, None).is_err());
        let rmds = RootMetadataSigned::sign(next, &reader_key, Some(f.rmds.writer_sig_info())).unwrap();
        rmds.is_valid_and_signed(None).unwrap();
        // the writer side is not checked for copied metadata
        rmds.is_last_modified_by(&f.alice, &reader_key.verifying_key()).unwrap();
    }

    #[test]
    fn test_signed_v2_generations_must_line_up() {
        let f = signed(MetadataVer::INITIAL_EXTRA);
        let mut md = f.rmds.md().clone();
        if let RootMetadata::V2(m) = &mut md {
            m.rkeys.clear();
        }
        // correctly signed, structurally broken
        let rmds = RootMetadataSigned::sign(md, &f.key, None).unwrap();
        let decoded = RootMetadataSigned::decode(&rmds.encode().unwrap(), MetadataVer::FIRST_VALID).unwrap();
        assert!(matches!(
            decoded.is_valid_and_signed(None),
            Err(MdError::Invalid(_))
        ));
    }

    #[test]
    fn test_envelope_round_trip() {
        let f = signed(MetadataVer::IMPLICIT_TEAMS);
        let bytes = f.rmds.encode().unwrap();
        let decoded = RootMetadataSigned::decode(&bytes, MetadataVer::FIRST_VALID).unwrap();
        assert_eq!(decoded, f.rmds);
        assert_eq!(decoded.encode().unwrap(), bytes);
        assert_eq!(decoded.hash().unwrap(), f.rmds.hash().unwrap());

        let mut wire: SignedWire = codec::decode(&bytes).unwrap();
        wire.version = MetadataVer::SEGREGATED_KEY_BUNDLES;
        assert!(matches!(
            RootMetadataSigned::decode(&codec::encode(&wire).unwrap(), MetadataVer::FIRST_VALID),
            Err(MdError::VersionMismatch { .. })
        ));
    }
}

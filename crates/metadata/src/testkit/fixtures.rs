use crate::crypto::{TlfCryptKey, TlfEphemeralPrivateKey, TlfPrivateKey};
use crate::keys::LocalDevice;
use crate::md::{
    ExtraMetadataV3, MdError, MetadataVer, PrivateMetadata, RootMetadata, RootMetadataSigned,
    UserDevicePublicKeys, UserDeviceServerHalves,
};
use crate::tlf::{TlfHandle, TlfId, TlfType};

pub type TestDevice = LocalDevice;

/// Crypt public keys of `devices`, grouped by user
pub fn device_keys(devices: &[&LocalDevice]) -> UserDevicePublicKeys {
    let mut keys = UserDevicePublicKeys::new();
    for device in devices {
        keys.entry(device.uid)
            .or_default()
            .insert(device.crypt_public_key());
    }
    keys
}

/// Sign as `device`, with a fresh writer signature
pub fn sign(md: RootMetadata, device: &LocalDevice) -> Result<RootMetadataSigned, MdError> {
    RootMetadataSigned::sign(md, &device.signing_key, None)
}

/// The unsigned next revision of `rmds`, in the same version
pub fn successor(
    rmds: &RootMetadataSigned,
    extra: Option<&ExtraMetadataV3>,
) -> Result<(RootMetadata, Option<ExtraMetadataV3>), MdError> {
    rmds.md()
        .make_successor_copy(&rmds.md_id()?, extra, rmds.version(), &[], false)
}

/// The first revision of a private folder, keyed for the given devices and
/// last modified by the first writer
#[derive(Debug, Clone)]
pub struct KeyedFolder {
    pub md: RootMetadata,
    pub extra: Option<ExtraMetadataV3>,
    pub halves: UserDeviceServerHalves,
    pub crypt_key: TlfCryptKey,
    pub tlf_key: TlfPrivateKey,
}

impl KeyedFolder {
    pub fn new(
        version: MetadataVer,
        writers: &[&LocalDevice],
        readers: &[&LocalDevice],
    ) -> Result<Self, MdError> {
        let first = writers
            .first()
            .ok_or_else(|| MdError::Invalid("a keyed folder needs a writer".to_string()))?;
        let writer_keys = device_keys(writers);
        let reader_keys = device_keys(readers);
        let handle = TlfHandle::new(
            writer_keys.keys().copied().collect(),
            reader_keys.keys().copied().collect(),
        );
        let mut md = RootMetadata::make_initial(version, TlfId::generate(TlfType::Private), &handle)?;

        let crypt_key = TlfCryptKey::generate();
        let tlf_key = TlfPrivateKey::generate();
        let (extra, halves) = md.add_key_generation(
            None,
            None,
            &writer_keys,
            &reader_keys,
            &TlfEphemeralPrivateKey::generate(),
            tlf_key.public(),
            &crypt_key,
        )?;
        let pmd = PrivateMetadata {
            tlf_private_key: Some(tlf_key.clone()),
            ..Default::default()
        };
        md.set_private_metadata(&pmd, Some(&crypt_key))?;
        md.set_last_modifying_writer(first.uid);
        md.set_last_modifying_user(first.uid);
        Ok(KeyedFolder {
            md,
            extra,
            halves,
            crypt_key,
            tlf_key,
        })
    }
}

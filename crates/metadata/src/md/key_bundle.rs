//! Per-device key material shared by every key bundle version
//!
//! A bundle maps `user -> device crypt public key -> TlfCryptKeyInfo`. Each
//! info holds the device's sealed client half, the ID under which the key
//! server keeps the matching server half, and the index of the ephemeral
//! public key the client half was sealed with.
//!
//! Maps are keyed by hex strings on the wire, which is what DAG-CBOR requires
//! of map keys.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::codec::UnknownFields;
use crate::crypto::{
    mask, CryptPublicKey, EncryptedTlfCryptKeyClientHalf, TlfCryptKey, TlfCryptKeyServerHalf,
    TlfCryptKeyServerHalfId, TlfEphemeralPrivateKey,
};
use crate::tlf::UserId;

use super::errors::MdError;

/// Device crypt public keys per user, as resolved from the identity layer
pub type UserDevicePublicKeys = BTreeMap<UserId, BTreeSet<CryptPublicKey>>;

/// Freshly generated server halves that must be pushed to the key server
pub type UserDeviceServerHalves = BTreeMap<UserId, BTreeMap<CryptPublicKey, TlfCryptKeyServerHalf>>;

/// Everything one device needs to recover one key generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlfCryptKeyInfo {
    pub client_half: EncryptedTlfCryptKeyClientHalf,
    pub server_half_id: TlfCryptKeyServerHalfId,
    /// Which ephemeral public key sealed `client_half`; see the bundle types
    /// for how the index is interpreted
    pub ephemeral_public_key_index: i64,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

pub type DeviceKeyInfoMap = BTreeMap<CryptPublicKey, TlfCryptKeyInfo>;

/// All devices of all users holding a bundle
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserDeviceKeyInfoMap(
    #[serde_as(as = "BTreeMap<DisplayFromStr, BTreeMap<DisplayFromStr, _>>")]
    BTreeMap<UserId, DeviceKeyInfoMap>,
);

impl UserDeviceKeyInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &UserId) -> Option<&DeviceKeyInfoMap> {
        self.0.get(uid)
    }

    pub fn get_mut(&mut self, uid: &UserId) -> Option<&mut DeviceKeyInfoMap> {
        self.0.get_mut(uid)
    }

    pub fn insert(&mut self, uid: UserId, devices: DeviceKeyInfoMap) -> Option<DeviceKeyInfoMap> {
        self.0.insert(uid, devices)
    }

    pub fn remove(&mut self, uid: &UserId) -> Option<DeviceKeyInfoMap> {
        self.0.remove(uid)
    }

    pub fn contains_user(&self, uid: &UserId) -> bool {
        self.0.contains_key(uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &DeviceKeyInfoMap)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&UserId, &mut DeviceKeyInfoMap)> {
        self.0.iter_mut()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key_info(&self, uid: &UserId, device: &CryptPublicKey) -> Option<&TlfCryptKeyInfo> {
        self.0.get(uid).and_then(|devices| devices.get(device))
    }

    /// The device public keys recorded for every user
    pub fn to_public_keys(&self) -> UserDevicePublicKeys {
        self.0
            .iter()
            .map(|(uid, devices)| (*uid, devices.keys().copied().collect()))
            .collect()
    }

    /// Add an entry for every `(user, device)` in `target` that lacks one.
    ///
    /// Each new entry gets a fresh server half; the matching client half is
    /// sealed with `ephemeral` and recorded under `new_index`. Existing
    /// entries are never overwritten. Users in `target` with no devices still
    /// get an (empty) entry. Returns the new server halves.
    pub fn fill_in_user_infos(
        &mut self,
        new_index: i64,
        target: &UserDevicePublicKeys,
        ephemeral: &TlfEphemeralPrivateKey,
        crypt_key: &TlfCryptKey,
    ) -> Result<UserDeviceServerHalves, MdError> {
        let mut server_halves = UserDeviceServerHalves::new();
        for (uid, devices) in target {
            let existing = self.0.entry(*uid).or_default();
            let mut user_halves = BTreeMap::new();
            for device in devices {
                if existing.contains_key(device) {
                    continue;
                }
                let server_half = TlfCryptKeyServerHalf::generate();
                let client_half = mask(&server_half, crypt_key);
                let sealed = EncryptedTlfCryptKeyClientHalf::seal(&client_half, device, ephemeral)?;
                existing.insert(
                    *device,
                    TlfCryptKeyInfo {
                        client_half: sealed,
                        server_half_id: TlfCryptKeyServerHalfId::make(uid, device, &server_half),
                        ephemeral_public_key_index: new_index,
                        unknown: UnknownFields::new(),
                    },
                );
                user_halves.insert(*device, server_half);
            }
            if !user_halves.is_empty() {
                server_halves.insert(*uid, user_halves);
            }
        }
        Ok(server_halves)
    }

    /// Remove every `(user, device)` not present in `current`.
    ///
    /// A user missing from `current` entirely is dropped and reported as
    /// removed. A user present in `current` with no devices keeps an empty
    /// entry and is *not* reported as removed, so it can be re-added later
    /// without resolving the user again.
    pub fn remove_devices_not_in(&mut self, current: &UserDevicePublicKeys) -> ServerHalfRemovalInfo {
        let mut info = ServerHalfRemovalInfo::default();
        let mut removed_users = Vec::new();

        for (uid, devices) in self.0.iter_mut() {
            let keep = current.get(uid);
            let mut removed = BTreeMap::new();
            devices.retain(|device, key_info| {
                let retained = keep.is_some_and(|keep| keep.contains(device));
                if !retained {
                    removed.insert(*device, vec![key_info.server_half_id.clone()]);
                }
                retained
            });

            let user_removed = keep.is_none();
            if user_removed {
                removed_users.push(*uid);
            }
            if user_removed || !removed.is_empty() {
                info.0.insert(
                    *uid,
                    UserServerHalfRemovalInfo {
                        user_removed,
                        device_server_half_ids: removed,
                    },
                );
            }
        }

        for uid in removed_users {
            self.0.remove(&uid);
        }
        info
    }
}

impl FromIterator<(UserId, DeviceKeyInfoMap)> for UserDeviceKeyInfoMap {
    fn from_iter<I: IntoIterator<Item = (UserId, DeviceKeyInfoMap)>>(iter: I) -> Self {
        UserDeviceKeyInfoMap(iter.into_iter().collect())
    }
}

/// What was removed for one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserServerHalfRemovalInfo {
    /// The user lost access entirely (as opposed to losing some devices)
    pub user_removed: bool,
    /// Server half IDs to delete, per removed device, one per generation
    pub device_server_half_ids: BTreeMap<CryptPublicKey, Vec<TlfCryptKeyServerHalfId>>,
}

/// Server halves that must be deleted after a revocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHalfRemovalInfo(BTreeMap<UserId, UserServerHalfRemovalInfo>);

impl ServerHalfRemovalInfo {
    pub fn get(&self, uid: &UserId) -> Option<&UserServerHalfRemovalInfo> {
        self.0.get(uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &UserServerHalfRemovalInfo)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every `(user, device, server half ID)` triple to delete
    pub fn server_half_ids(
        &self,
    ) -> impl Iterator<Item = (&UserId, &CryptPublicKey, &TlfCryptKeyServerHalfId)> {
        self.0.iter().flat_map(|(uid, info)| {
            info.device_server_half_ids
                .iter()
                .flat_map(move |(device, ids)| ids.iter().map(move |id| (uid, device, id)))
        })
    }

    /// Merge removals computed over disjoint user sets (writers and readers
    /// of one generation). A user claimed by both sides is a conflict.
    pub fn merge_users(&self, other: &ServerHalfRemovalInfo) -> Result<ServerHalfRemovalInfo, MdError> {
        let mut merged = self.clone();
        for (uid, info) in &other.0 {
            if merged.0.contains_key(uid) {
                return Err(MdError::RemovalInfoConflict(format!(
                    "user {} is present in both removal sets",
                    uid
                )));
            }
            merged.0.insert(*uid, info.clone());
        }
        Ok(merged)
    }

    /// Append the removals for another key generation. Both sides must name
    /// the same users, with matching `user_removed` flags and device sets.
    pub fn add_generation(&mut self, other: &ServerHalfRemovalInfo) -> Result<(), MdError> {
        if self.0.len() != other.0.len() {
            return Err(MdError::RemovalInfoConflict(format!(
                "user count mismatch: {} vs {}",
                self.0.len(),
                other.0.len()
            )));
        }
        for (uid, info) in self.0.iter_mut() {
            let other_info = other.0.get(uid).ok_or_else(|| {
                MdError::RemovalInfoConflict(format!("user {} missing from generation", uid))
            })?;
            if info.user_removed != other_info.user_removed {
                return Err(MdError::RemovalInfoConflict(format!(
                    "user {} removed in one generation but not another",
                    uid
                )));
            }
            let devices: BTreeSet<_> = info.device_server_half_ids.keys().collect();
            let other_devices: BTreeSet<_> = other_info.device_server_half_ids.keys().collect();
            if devices != other_devices {
                return Err(MdError::RemovalInfoConflict(format!(
                    "device set mismatch for user {}",
                    uid
                )));
            }
            for (device, ids) in info.device_server_half_ids.iter_mut() {
                if let Some(more) = other_info.device_server_half_ids.get(device) {
                    ids.extend(more.iter().cloned());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{unmask, CryptPrivateKey};

    fn devices(keys: &[CryptPublicKey]) -> BTreeSet<CryptPublicKey> {
        keys.iter().copied().collect()
    }

    #[test]
    fn test_fill_in_never_overwrites() {
        let alice = UserId::generate();
        let a1 = CryptPrivateKey::generate();
        let a2 = CryptPrivateKey::generate();
        let ephemeral = TlfEphemeralPrivateKey::generate();
        let key = TlfCryptKey::generate();

        let mut map = UserDeviceKeyInfoMap::new();
        let target = UserDevicePublicKeys::from([(alice, devices(&[a1.public()]))]);
        let halves = map.fill_in_user_infos(0, &target, &ephemeral, &key).unwrap();
        assert_eq!(halves[&alice].len(), 1);
        let first = map.key_info(&alice, &a1.public()).unwrap().clone();

        let target = UserDevicePublicKeys::from([(alice, devices(&[a1.public(), a2.public()]))]);
        let halves = map.fill_in_user_infos(3, &target, &ephemeral, &key).unwrap();
        assert_eq!(halves[&alice].len(), 1);
        assert!(halves[&alice].contains_key(&a2.public()));
        assert_eq!(map.key_info(&alice, &a1.public()).unwrap(), &first);
        assert_eq!(
            map.key_info(&alice, &a2.public()).unwrap().ephemeral_public_key_index,
            3
        );

        // the new device can rebuild the key
        let info = map.key_info(&alice, &a2.public()).unwrap();
        let client_half = info.client_half.open(&a2, &ephemeral.public()).unwrap();
        let server_half = halves[&alice][&a2.public()];
        info.server_half_id.verify(&alice, &a2.public(), &server_half).unwrap();
        assert_eq!(unmask(&server_half, &client_half), key);
    }

    #[test]
    fn test_user_without_devices_gets_entry() {
        let bob = UserId::generate();
        let mut map = UserDeviceKeyInfoMap::new();
        let target = UserDevicePublicKeys::from([(bob, BTreeSet::new())]);
        let halves = map
            .fill_in_user_infos(0, &target, &TlfEphemeralPrivateKey::generate(), &TlfCryptKey::generate())
            .unwrap();
        assert!(halves.is_empty());
        assert!(map.contains_user(&bob));
        assert!(map.get(&bob).unwrap().is_empty());
    }

    #[test]
    fn test_remove_last_device_vs_remove_user() {
        let alice = UserId::generate();
        let bob = UserId::generate();
        let a1 = CryptPrivateKey::generate().public();
        let b1 = CryptPrivateKey::generate().public();
        let mut map = UserDeviceKeyInfoMap::new();
        let target = UserDevicePublicKeys::from([(alice, devices(&[a1])), (bob, devices(&[b1]))]);
        map.fill_in_user_infos(0, &target, &TlfEphemeralPrivateKey::generate(), &TlfCryptKey::generate())
            .unwrap();
        let alice_id = map.key_info(&alice, &a1).unwrap().server_half_id.clone();

        // alice keeps her membership but loses her only device; bob is gone
        let current = UserDevicePublicKeys::from([(alice, BTreeSet::new())]);
        let info = map.remove_devices_not_in(&current);

        let alice_info = info.get(&alice).unwrap();
        assert!(!alice_info.user_removed);
        assert_eq!(alice_info.device_server_half_ids[&a1], vec![alice_id]);
        assert!(info.get(&bob).unwrap().user_removed);

        assert!(map.contains_user(&alice));
        assert!(map.get(&alice).unwrap().is_empty());
        assert!(!map.contains_user(&bob));
        assert_eq!(info.server_half_ids().count(), 2);
    }

    #[test]
    fn test_nothing_removed() {
        let alice = UserId::generate();
        let a1 = CryptPrivateKey::generate().public();
        let mut map = UserDeviceKeyInfoMap::new();
        let target = UserDevicePublicKeys::from([(alice, devices(&[a1]))]);
        map.fill_in_user_infos(0, &target, &TlfEphemeralPrivateKey::generate(), &TlfCryptKey::generate())
            .unwrap();
        assert!(map.remove_devices_not_in(&target).is_empty());
    }

    #[test]
    fn test_removal_info_merging() {
        let alice = UserId::generate();
        let bob = UserId::generate();
        let a1 = CryptPrivateKey::generate().public();
        let b1 = CryptPrivateKey::generate().public();
        let ephemeral = TlfEphemeralPrivateKey::generate();

        let build = |uid: UserId, device: CryptPublicKey| {
            let mut map = UserDeviceKeyInfoMap::new();
            let target = UserDevicePublicKeys::from([(uid, devices(&[device]))]);
            map.fill_in_user_infos(0, &target, &ephemeral, &TlfCryptKey::generate())
                .unwrap();
            map.remove_devices_not_in(&UserDevicePublicKeys::new())
        };

        let writers = build(alice, a1);
        let readers = build(bob, b1);
        let merged = writers.merge_users(&readers).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(writers.merge_users(&writers).is_err());

        // a second generation for the same users appends IDs
        let mut total = merged.clone();
        let next = build(alice, a1).merge_users(&build(bob, b1)).unwrap();
        total.add_generation(&next).unwrap();
        assert_eq!(total.get(&alice).unwrap().device_server_half_ids[&a1].len(), 2);
        assert_eq!(total.server_half_ids().count(), 4);

        // mismatched users are refused
        let mut total = merged;
        assert!(total.add_generation(&build(alice, a1)).is_err());
    }

    #[test]
    fn test_removed_flag_must_agree_across_generations() {
        let alice = UserId::generate();
        let a1 = CryptPrivateKey::generate().public();
        let a2 = CryptPrivateKey::generate().public();

        let mut removed = ServerHalfRemovalInfo::default();
        removed.0.insert(
            alice,
            UserServerHalfRemovalInfo {
                user_removed: true,
                device_server_half_ids: BTreeMap::from([(a1, vec![])]),
            },
        );
        let mut kept = removed.clone();
        kept.0.get_mut(&alice).unwrap().user_removed = false;
        assert!(removed.clone().add_generation(&kept).is_err());

        let mut other_device = removed.clone();
        other_device.0.get_mut(&alice).unwrap().device_server_half_ids =
            BTreeMap::from([(a2, vec![])]);
        assert!(removed.add_generation(&other_device).is_err());
    }

    #[test]
    fn test_encoding_uses_string_keys() {
        let alice = UserId::generate();
        let a1 = CryptPrivateKey::generate().public();
        let mut map = UserDeviceKeyInfoMap::new();
        let target = UserDevicePublicKeys::from([(alice, devices(&[a1]))]);
        map.fill_in_user_infos(0, &target, &TlfEphemeralPrivateKey::generate(), &TlfCryptKey::generate())
            .unwrap();

        let bytes = crate::codec::encode(&map).unwrap();
        let decoded: UserDeviceKeyInfoMap = crate::codec::decode(&bytes).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(crate::codec::encode(&decoded).unwrap(), bytes);
    }
}

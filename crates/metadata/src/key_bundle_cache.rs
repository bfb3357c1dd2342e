//! Size-bounded cache for externally stored key bundles
//!
//! Bundles are immutable and addressed by the hash of their contents, so the
//! cache never needs invalidating: an entry is either present and correct or
//! evicted. Puts whose ID does not match the bundle are refused, which keeps a
//! lookup from ever returning something other than what the ID names.
//!
//! Two eviction policies are available. LRU is backed by [`moka`] with a byte
//! weigher; random eviction is a small hand-rolled map for callers that want
//! eviction that cannot be steered by access patterns.

use std::collections::HashMap;
use std::hash::Hash as StdHash;
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::md::{
    ExtraMetadataV3, MdError, ReaderKeyBundleV3, TlfReaderKeyBundleId, TlfWriterKeyBundleId,
    WriterKeyBundleV3,
};
use crate::tlf::TlfId;

/// Default capacity: 10 MiB of encoded bundles
pub const DEFAULT_KEY_BUNDLE_CACHE_CAPACITY_BYTES: u64 = 10 * 1024 * 1024;

/// How a full cache picks its victim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    Lru,
    Random,
}

/// A byte-bounded concurrent cache
pub trait EvictedCache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Insert `value`, which accounts for `size` bytes
    fn put(&self, key: K, value: V, size: u32);

    /// Total size of the entries currently held
    fn weighted_size(&self) -> u64;

    fn entry_count(&self) -> u64;

    /// Apply any deferred bookkeeping (eviction, access order)
    fn sync(&self) {}
}

/// LRU eviction over a moka cache
pub struct LruEvictedCache<K, V>
where
    K: StdHash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<K, (V, u32)>,
}

impl<K, V> LruEvictedCache<K, V>
where
    K: StdHash + Eq + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_key: &K, value: &(V, u32)| value.1)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(|key: Arc<K>, _value, cause| {
                if matches!(cause, RemovalCause::Size) {
                    tracing::debug!("evicted {:?} from key bundle cache", key);
                }
            })
            .build();
        Self { inner }
    }
}

impl<K, V> EvictedCache<K, V> for LruEvictedCache<K, V>
where
    K: StdHash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|(value, _)| value)
    }

    fn put(&self, key: K, value: V, size: u32) {
        self.inner.insert(key, (value, size));
    }

    fn weighted_size(&self) -> u64 {
        self.inner.weighted_size()
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    fn sync(&self) {
        self.inner.run_pending_tasks();
    }
}

struct RandomState<K, V> {
    entries: HashMap<K, (V, u32)>,
    keys: Vec<K>,
    total: u64,
}

/// Random eviction
pub struct RandomEvictedCache<K, V> {
    capacity_bytes: u64,
    state: Mutex<RandomState<K, V>>,
}

impl<K, V> RandomEvictedCache<K, V>
where
    K: StdHash + Eq + Clone,
{
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            state: Mutex::new(RandomState {
                entries: HashMap::new(),
                keys: Vec::new(),
                total: 0,
            }),
        }
    }
}

impl<K, V> EvictedCache<K, V> for RandomEvictedCache<K, V>
where
    K: StdHash + Eq + Clone + Send + Sync + std::fmt::Debug,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.state.lock().entries.get(key).map(|(value, _)| value.clone())
    }

    fn put(&self, key: K, value: V, size: u32) {
        if u64::from(size) > self.capacity_bytes {
            return;
        }
        let mut state = self.state.lock();
        match state.entries.insert(key.clone(), (value, size)) {
            Some((_, old)) => state.total -= u64::from(old),
            None => state.keys.push(key),
        }
        state.total += u64::from(size);

        let mut rng = rand::rng();
        while state.total > self.capacity_bytes && !state.keys.is_empty() {
            let victim = rng.random_range(0..state.keys.len());
            let victim = state.keys.swap_remove(victim);
            if let Some((_, size)) = state.entries.remove(&victim) {
                state.total -= u64::from(size);
            }
            tracing::debug!("evicted {:?} from key bundle cache", victim);
        }
    }

    fn weighted_size(&self) -> u64 {
        self.state.lock().total
    }

    fn entry_count(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }
}

/// Identifies one cached bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyBundleCacheKey {
    Writer(TlfId, TlfWriterKeyBundleId),
    Reader(TlfId, TlfReaderKeyBundleId),
}

#[derive(Debug, Clone)]
pub enum CachedKeyBundle {
    Writer(Arc<WriterKeyBundleV3>),
    Reader(Arc<ReaderKeyBundleV3>),
}

/// Concurrent cache of V3 key bundles
pub struct KeyBundleCache {
    inner: Box<dyn EvictedCache<KeyBundleCacheKey, CachedKeyBundle>>,
}

impl std::fmt::Debug for KeyBundleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundleCache")
            .field("entry_count", &self.inner.entry_count())
            .field("weighted_size", &self.inner.weighted_size())
            .finish()
    }
}

impl KeyBundleCache {
    pub fn new(capacity_bytes: u64, policy: CachePolicy) -> Self {
        let inner: Box<dyn EvictedCache<_, _>> = match policy {
            CachePolicy::Lru => Box::new(LruEvictedCache::new(capacity_bytes)),
            CachePolicy::Random => Box::new(RandomEvictedCache::new(capacity_bytes)),
        };
        Self { inner }
    }

    fn encoded_size<T: Serialize + serde::de::DeserializeOwned>(bundle: &T) -> Result<u32, MdError> {
        let len = codec::encode(bundle)?.len();
        Ok(u32::try_from(len).unwrap_or(u32::MAX))
    }

    pub fn get_writer_bundle(&self, tlf: TlfId, id: &TlfWriterKeyBundleId) -> Option<Arc<WriterKeyBundleV3>> {
        match self.inner.get(&KeyBundleCacheKey::Writer(tlf, id.clone()))? {
            CachedKeyBundle::Writer(bundle) => Some(bundle),
            CachedKeyBundle::Reader(_) => None,
        }
    }

    pub fn get_reader_bundle(&self, tlf: TlfId, id: &TlfReaderKeyBundleId) -> Option<Arc<ReaderKeyBundleV3>> {
        match self.inner.get(&KeyBundleCacheKey::Reader(tlf, id.clone()))? {
            CachedKeyBundle::Reader(bundle) => Some(bundle),
            CachedKeyBundle::Writer(_) => None,
        }
    }

    pub fn put_writer_bundle(
        &self,
        tlf: TlfId,
        id: TlfWriterKeyBundleId,
        bundle: WriterKeyBundleV3,
    ) -> Result<(), MdError> {
        if let Err(e) = id.verify(&bundle) {
            tracing::warn!("refusing to cache writer bundle for {}: {}", tlf, e);
            return Err(e);
        }
        let size = Self::encoded_size(&bundle)?;
        self.inner.put(
            KeyBundleCacheKey::Writer(tlf, id),
            CachedKeyBundle::Writer(Arc::new(bundle)),
            size,
        );
        Ok(())
    }

    pub fn put_reader_bundle(
        &self,
        tlf: TlfId,
        id: TlfReaderKeyBundleId,
        bundle: ReaderKeyBundleV3,
    ) -> Result<(), MdError> {
        if let Err(e) = id.verify(&bundle) {
            tracing::warn!("refusing to cache reader bundle for {}: {}", tlf, e);
            return Err(e);
        }
        let size = Self::encoded_size(&bundle)?;
        self.inner.put(
            KeyBundleCacheKey::Reader(tlf, id),
            CachedKeyBundle::Reader(Arc::new(bundle)),
            size,
        );
        Ok(())
    }

    /// Both bundles, if both are cached
    pub fn get_extra(
        &self,
        tlf: TlfId,
        wkb_id: &TlfWriterKeyBundleId,
        rkb_id: &TlfReaderKeyBundleId,
    ) -> Option<ExtraMetadataV3> {
        let wkb = self.get_writer_bundle(tlf, wkb_id)?;
        let rkb = self.get_reader_bundle(tlf, rkb_id)?;
        Some(ExtraMetadataV3::new(
            (*wkb).clone(),
            (*rkb).clone(),
            false,
            false,
        ))
    }

    pub fn put_extra(&self, tlf: TlfId, extra: &ExtraMetadataV3) -> Result<(), MdError> {
        let (wkb_id, rkb_id) = extra.ids()?;
        self.put_writer_bundle(tlf, wkb_id, extra.wkb.clone())?;
        self.put_reader_bundle(tlf, rkb_id, extra.rkb.clone())
    }

    pub fn weighted_size(&self) -> u64 {
        self.inner.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn sync(&self) {
        self.inner.sync()
    }
}

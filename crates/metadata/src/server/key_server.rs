use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::context::RequestContext;
use crate::crypto::{CryptPublicKey, TlfCryptKeyServerHalf, TlfCryptKeyServerHalfId};
use crate::md::UserDeviceServerHalves;
use crate::tlf::UserId;

use super::errors::ServerError;

/// Holds the server halves of folder crypt keys, one per (generation,
/// device). A half is looked up by the ID recorded next to the matching
/// client half in a key bundle.
#[async_trait]
pub trait KeyServer: Send + Sync + std::fmt::Debug + 'static {
    /// The half named by `id`, which must belong to `device`
    async fn get_server_half(
        &self,
        ctx: &RequestContext,
        id: &TlfCryptKeyServerHalfId,
        device: &CryptPublicKey,
    ) -> Result<TlfCryptKeyServerHalf, ServerError>;

    /// Store every half of a rekey; each is filed under its derived ID
    async fn put_server_halves(
        &self,
        ctx: &RequestContext,
        halves: &UserDeviceServerHalves,
    ) -> Result<(), ServerError>;

    /// Remove a revoked device's half
    async fn delete_server_half(
        &self,
        ctx: &RequestContext,
        uid: &UserId,
        device: &CryptPublicKey,
        id: &TlfCryptKeyServerHalfId,
    ) -> Result<(), ServerError>;
}

#[derive(Debug, Clone)]
struct StoredServerHalf {
    uid: UserId,
    device: CryptPublicKey,
    half: TlfCryptKeyServerHalf,
}

/// In-memory key server
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyServer {
    inner: Arc<RwLock<HashMap<TlfCryptKeyServerHalfId, StoredServerHalf>>>,
}

impl MemoryKeyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl KeyServer for MemoryKeyServer {
    async fn get_server_half(
        &self,
        ctx: &RequestContext,
        id: &TlfCryptKeyServerHalfId,
        device: &CryptPublicKey,
    ) -> Result<TlfCryptKeyServerHalf, ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let stored = inner
            .get(id)
            .ok_or_else(|| ServerError::NotFound(format!("server half {}", id)))?;
        if stored.device != *device {
            return Err(ServerError::Unauthorized(format!(
                "server half {} belongs to another device",
                id
            )));
        }
        Ok(stored.half)
    }

    async fn put_server_halves(
        &self,
        ctx: &RequestContext,
        halves: &UserDeviceServerHalves,
    ) -> Result<(), ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let mut inner = self.inner.write();
        let mut count = 0;
        for (uid, devices) in halves {
            for (device, half) in devices {
                let id = TlfCryptKeyServerHalfId::make(uid, device, half);
                inner.insert(
                    id,
                    StoredServerHalf {
                        uid: *uid,
                        device: *device,
                        half: *half,
                    },
                );
                count += 1;
            }
        }
        tracing::debug!(trace_id = %ctx.trace_id(), "stored {} server halves", count);
        Ok(())
    }

    async fn delete_server_half(
        &self,
        ctx: &RequestContext,
        uid: &UserId,
        device: &CryptPublicKey,
        id: &TlfCryptKeyServerHalfId,
    ) -> Result<(), ServerError> {
        if ctx.is_expired() {
            return Err(ServerError::DeadlineExceeded);
        }
        let mut inner = self.inner.write();
        match inner.get(id).map(|stored| (stored.uid, stored.device)) {
            None => Err(ServerError::NotFound(format!("server half {}", id))),
            Some(owner) if owner != (*uid, *device) => {
                Err(ServerError::Unauthorized(format!(
                    "server half {} does not belong to {}",
                    id, uid
                )))
            }
            Some(_) => {
                inner.remove(id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::crypto::CryptPrivateKey;

    #[tokio::test]
    async fn test_put_get_delete() {
        let server = MemoryKeyServer::new();
        let ctx = RequestContext::new();
        let uid = UserId::generate();
        let device = CryptPrivateKey::generate().public();
        let other = CryptPrivateKey::generate().public();
        let half = TlfCryptKeyServerHalf::generate();
        let halves = UserDeviceServerHalves::from([(uid, BTreeMap::from([(device, half)]))]);
        server.put_server_halves(&ctx, &halves).await.unwrap();
        assert_eq!(server.len(), 1);

        let id = TlfCryptKeyServerHalfId::make(&uid, &device, &half);
        assert_eq!(server.get_server_half(&ctx, &id, &device).await.unwrap(), half);
        assert!(matches!(
            server.get_server_half(&ctx, &id, &other).await,
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            server
                .delete_server_half(&ctx, &UserId::generate(), &device, &id)
                .await,
            Err(ServerError::Unauthorized(_))
        ));

        server.delete_server_half(&ctx, &uid, &device, &id).await.unwrap();
        assert!(server.is_empty());
        assert!(matches!(
            server.get_server_half(&ctx, &id, &device).await,
            Err(ServerError::NotFound(_))
        ));
    }
}

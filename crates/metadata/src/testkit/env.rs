use std::ops::Deref;
use std::sync::Arc;

use crate::config::Config;
use crate::keys::{KeyManager, LocalDevice};
use crate::server::{MemoryKeyServer, MemoryMdServer, MemoryMerkleService};
use crate::tlf::UserId;

/// Servers shared by every client of a test
///
/// Each client gets its own key bundle cache and folder locks, like
/// separate processes would.
#[derive(Debug, Clone)]
pub struct TestEnv {
    pub md_server: Arc<MemoryMdServer>,
    pub key_server: Arc<MemoryKeyServer>,
    pub merkle: Arc<MemoryMerkleService>,
    config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            md_server: Arc::new(MemoryMdServer::new()),
            key_server: Arc::new(MemoryKeyServer::new()),
            merkle: Arc::new(MemoryMerkleService::new()),
            config,
        }
    }

    /// Use `md_server` instead of an unrestricted one
    pub fn with_md_server(mut self, md_server: MemoryMdServer) -> Self {
        self.md_server = Arc::new(md_server);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A client for a new user
    pub fn client(&self) -> TestClient {
        self.client_with_config(LocalDevice::generate(), &self.config)
    }

    /// A client for another device of `uid`
    pub fn device_of(&self, uid: UserId) -> TestClient {
        self.client_with_config(LocalDevice::for_user(uid), &self.config)
    }

    /// A client for `device` with its own configuration, e.g. an older
    /// metadata version
    pub fn client_with_config(&self, device: LocalDevice, config: &Config) -> TestClient {
        let manager = KeyManager::new(
            device,
            self.md_server.clone(),
            self.key_server.clone(),
            config,
        )
        .with_merkle(self.merkle.clone());
        tracing::debug!("new test client {}", manager.device().uid);
        TestClient { manager }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// One device talking to a [`TestEnv`]
#[derive(Debug, Clone)]
pub struct TestClient {
    manager: KeyManager,
}

impl TestClient {
    pub fn uid(&self) -> UserId {
        self.manager.device().uid
    }

    pub fn manager(&self) -> &KeyManager {
        &self.manager
    }
}

impl Deref for TestClient {
    type Target = KeyManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

//! Shared utilities for metadata integration tests
#![allow(dead_code)]

use std::sync::Once;

use metadata::config::Config;
use metadata::context::RequestContext;
use metadata::keys::FolderHead;
use metadata::md::UserDevicePublicKeys;
use metadata::testkit::{device_keys, TestClient, TestEnv};
use metadata::tlf::TlfType;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG` or
/// the default log level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Config::default().log_level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn no_devices() -> UserDevicePublicKeys {
    UserDevicePublicKeys::new()
}

/// Create a private folder owned by `owner` and shared read-only with
/// `readers`
pub async fn shared_folder(owner: &TestClient, readers: &[&TestClient]) -> FolderHead {
    let ctx = RequestContext::new();
    let reader_devices: Vec<_> = readers.iter().map(|client| client.device()).collect();
    owner
        .create_folder(
            &ctx,
            TlfType::Private,
            &device_keys(&[owner.device()]),
            &device_keys(&reader_devices),
        )
        .await
        .unwrap()
}

/// A fresh environment with tracing set up
pub fn setup() -> TestEnv {
    init_tracing();
    TestEnv::new()
}

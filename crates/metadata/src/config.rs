use std::path::Path;
use std::sync::Arc;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::crypto::{AuthToken, AuthTokenRefreshHandler, Signer};
use crate::key_bundle_cache::{CachePolicy, KeyBundleCache, DEFAULT_KEY_BUNDLE_CACHE_CAPACITY_BYTES};
use crate::md::MetadataVer;

pub const CONFIG_FILE_NAME: &str = "metadata.toml";

/// Token type presented to the metadata and key servers
pub const AUTH_TOKEN_TYPE: &str = "tlf_session";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Byte budget of the key bundle cache
    #[serde(default = "default_cache_capacity")]
    pub key_bundle_cache_capacity_bytes: u64,
    #[serde(default)]
    pub key_bundle_cache_policy: CachePolicy,
    /// Version new folders are created with, and successors are
    /// up-converted to
    #[serde(default = "default_metadata_version")]
    pub metadata_version: MetadataVer,
    /// Revisions older than this are refused
    #[serde(default = "default_min_metadata_version")]
    pub min_metadata_version: MetadataVer,
    #[serde(default = "default_auth_token_expire_seconds")]
    pub auth_token_expire_seconds: u64,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// `tracing` filter directive for binaries embedding this crate
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cache_capacity() -> u64 {
    DEFAULT_KEY_BUNDLE_CACHE_CAPACITY_BYTES
}

fn default_metadata_version() -> MetadataVer {
    MetadataVer::LATEST
}

fn default_min_metadata_version() -> MetadataVer {
    MetadataVer::FIRST_VALID
}

fn default_auth_token_expire_seconds() -> u64 {
    60 * 60 * 24
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_bundle_cache_capacity_bytes: default_cache_capacity(),
            key_bundle_cache_policy: CachePolicy::default(),
            metadata_version: default_metadata_version(),
            min_metadata_version: default_min_metadata_version(),
            auth_token_expire_seconds: default_auth_token_expire_seconds(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for version in [self.metadata_version, self.min_metadata_version] {
            if !version.is_valid() || version > MetadataVer::LATEST {
                return Err(ConfigError::Invalid(format!(
                    "unsupported metadata version {}",
                    version
                )));
            }
        }
        if self.min_metadata_version > self.metadata_version {
            return Err(ConfigError::Invalid(format!(
                "minimum metadata version {} exceeds default {}",
                self.min_metadata_version, self.metadata_version
            )));
        }
        if self.key_bundle_cache_capacity_bytes == 0 {
            return Err(ConfigError::Invalid(
                "key bundle cache capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn key_bundle_cache(&self) -> KeyBundleCache {
        KeyBundleCache::new(
            self.key_bundle_cache_capacity_bytes,
            self.key_bundle_cache_policy,
        )
    }

    pub fn auth_token(
        &self,
        signer: Arc<dyn Signer>,
        refresh_handler: Arc<dyn AuthTokenRefreshHandler>,
    ) -> AuthToken {
        AuthToken::new(
            AUTH_TOKEN_TYPE,
            self.auth_token_expire_seconds,
            self.client_name.clone(),
            self.client_version.clone(),
            signer,
            refresh_handler,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::from_toml("key_bundle_cache_policy = \"random\"\n").unwrap();
        assert_eq!(config.key_bundle_cache_policy, CachePolicy::Random);
        assert_eq!(config.metadata_version, MetadataVer::LATEST);
        assert_eq!(
            config.key_bundle_cache_capacity_bytes,
            DEFAULT_KEY_BUNDLE_CACHE_CAPACITY_BYTES
        );
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = Config {
            metadata_version: MetadataVer::SEGREGATED_KEY_BUNDLES,
            min_metadata_version: MetadataVer::INITIAL_EXTRA,
            log_level: "metadata=debug".to_string(),
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(matches!(
            Config::from_toml("metadata_version = 9\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("metadata_version = 2\nmin_metadata_version = 3\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("key_bundle_cache_capacity_bytes = \"lots\"\n"),
            Err(ConfigError::TomlDe(_))
        ));
    }
}

//! Signed, time-boxed session tokens for the metadata and key servers
//!
//! A token is the hex encoding of a JSON [`AuthTokenBody`] joined by `.` to
//! the hex encoding of a domain-separated signature over that JSON. Once a
//! token has been signed, a background task asks the owner to re-authenticate
//! every `max(expire_in / 2, 60s)` until the token is re-signed or shut down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tokio::task::JoinHandle;

use super::keys::VerifyingKey;
use super::signature::{verify, SigVer, SignatureInfo, Signer};
use super::CryptoError;
use crate::tlf::UserId;

/// Refreshes never happen more often than this
pub const AUTH_TOKEN_MIN_REFRESH_SECONDS: u64 = 60;

/// A server-issued challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeInfo {
    /// Server time, unix seconds
    pub now: i64,
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokenBody {
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde_as(as = "DisplayFromStr")]
    pub uid: UserId,
    pub username: String,
    #[serde_as(as = "DisplayFromStr")]
    pub verifying_key: VerifyingKey,
    pub challenge: String,
    /// Creation time, unix seconds (server clock)
    pub ctime: i64,
    pub expire_in: u64,
    pub client: ClientInfo,
}

impl AuthTokenBody {
    /// Expiry in unix seconds, or `None` when it does not fit an `i64`
    pub fn expires_at(&self) -> Option<i64> {
        i64::try_from(self.expire_in)
            .ok()
            .and_then(|expire_in| self.ctime.checked_add(expire_in))
    }

    /// A token whose expiry cannot be represented counts as expired
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at().map_or(true, |expires_at| now > expires_at)
    }
}

/// Called by the refresh ticker when a token is due to be replaced
#[async_trait]
pub trait AuthTokenRefreshHandler: Send + Sync + 'static {
    async fn refresh_auth_token(&self);
}

/// Signs auth tokens and keeps them fresh
pub struct AuthToken {
    token_type: String,
    expire_in: u64,
    client: ClientInfo,
    signer: Arc<dyn Signer>,
    refresh_handler: Arc<dyn AuthTokenRefreshHandler>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("token_type", &self.token_type)
            .field("expire_in", &self.expire_in)
            .field("client", &self.client)
            .finish()
    }
}

impl AuthToken {
    pub fn new(
        token_type: impl Into<String>,
        expire_in: u64,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
        signer: Arc<dyn Signer>,
        refresh_handler: Arc<dyn AuthTokenRefreshHandler>,
    ) -> Self {
        AuthToken {
            token_type: token_type.into(),
            expire_in,
            client: ClientInfo {
                name: client_name.into(),
                version: client_version.into(),
            },
            signer,
            refresh_handler,
            ticker: Mutex::new(None),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs((self.expire_in / 2).max(AUTH_TOKEN_MIN_REFRESH_SECONDS))
    }

    /// Sign a token answering `challenge` and (re)start the refresh ticker.
    ///
    /// The ticker is only started when called from within a tokio runtime.
    pub fn sign(
        &self,
        uid: UserId,
        username: &str,
        challenge: &ChallengeInfo,
    ) -> Result<String, CryptoError> {
        let body = AuthTokenBody {
            token_type: self.token_type.clone(),
            uid,
            username: username.to_string(),
            verifying_key: self.signer.verifying_key(),
            challenge: challenge.challenge.clone(),
            ctime: challenge.now,
            expire_in: self.expire_in,
            client: self.client.clone(),
        };
        if body.expires_at().is_none() {
            return Err(anyhow::anyhow!("auth token lifetime {}s is out of range", self.expire_in).into());
        }
        let json = serde_json::to_vec(&body).map_err(anyhow::Error::from)?;
        let sig = self.signer.sign_prefixed(&json);
        self.start_ticker();
        Ok(format!("{}.{}", hex::encode(&json), hex::encode(&sig.signature)))
    }

    /// Check a token's signature and expiry, returning its body
    pub fn verify(token: &str, now: i64) -> Result<AuthTokenBody, CryptoError> {
        let (body_hex, sig_hex) = token
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("malformed auth token"))?;
        let json = hex::decode(body_hex).map_err(anyhow::Error::from)?;
        let signature = hex::decode(sig_hex).map_err(anyhow::Error::from)?;
        let body: AuthTokenBody = serde_json::from_slice(&json).map_err(anyhow::Error::from)?;
        verify(
            &json,
            &SignatureInfo {
                version: SigVer::ED25519_PREFIXED,
                signature,
                verifying_key: body.verifying_key,
            },
        )?;
        let expires_at = body.expires_at().ok_or_else(|| {
            anyhow::anyhow!(
                "auth token lifetime {}s from {} is out of range",
                body.expire_in,
                body.ctime
            )
        })?;
        if now > expires_at {
            return Err(anyhow::anyhow!("auth token expired at {}", expires_at).into());
        }
        Ok(body)
    }

    fn start_ticker(&self) {
        let mut ticker = self.ticker.lock();
        if let Some(old) = ticker.take() {
            old.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime; auth token will not refresh itself");
            return;
        };
        let handler = self.refresh_handler.clone();
        let period = self.refresh_interval();
        *ticker = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                tracing::debug!("refreshing auth token");
                handler.refresh_auth_token().await;
            }
        }));
    }

    /// Stop the refresh ticker
    pub fn shutdown(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
    }
}

impl Drop for AuthToken {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Gateway credentials.
//!
//! The broker accepts a short lived access token (a JWT) as password. It is exchanged
//! only when its embedded expiry says so: with the refresh token when one is held,
//! otherwise by registering the gateway again. Tokens are persisted per environment and
//! owner in a small JSON file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::now_millis;
use crate::logutil::mask_secret;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The refresh token is no longer accepted. It is dropped so the next exchange
    /// registers the gateway again.
    #[error("refresh token rejected")]
    Rejected,
    #[error("credential backend unreachable: {0}")]
    Unreachable(String),
    #[error("credential store error: {0}")]
    Store(String),
}

impl From<std::io::Error> for CredentialError {
    fn from(e: std::io::Error) -> Self {
        CredentialError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(e: serde_json::Error) -> Self {
        CredentialError::Store(e.to_string())
    }
}

/// Claims the gateway cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub username: Option<String>,
}

impl TokenClaims {
    /// Decode the payload segment of a JWT. The signature is not checked.
    pub fn decode(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Valid until a twelfth of its lifetime before expiry.
    pub fn is_valid_at(&self, now_secs: i64) -> bool {
        let leeway = (self.exp - self.iat).max(0) / 12;
        now_secs < self.exp - leeway
    }
}

pub fn token_is_valid(token: &str, now_ms: i64) -> bool {
    TokenClaims::decode(token).is_some_and(|c| c.is_valid_at(now_ms / 1000))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Backend that issues gateway tokens.
#[async_trait]
pub trait CredentialApi: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, CredentialError>;
    async fn register(&self, owner_id: &str, gateway_id: &str) -> Result<TokenPair, CredentialError>;
}

/// Credential API used when no backend is configured. Registration issues an unsigned
/// token for the owner, valid for an hour.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCredentialApi;

impl LocalCredentialApi {
    pub fn issue(owner_id: &str, lifetime_secs: i64) -> String {
        let now = now_millis() / 1000;
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = serde_json::json!({ "exp": now + lifetime_secs, "iat": now, "username": owner_id });
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.", header, body)
    }
}

#[async_trait]
impl CredentialApi for LocalCredentialApi {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, CredentialError> {
        Err(CredentialError::Rejected)
    }

    async fn register(&self, owner_id: &str, _gateway_id: &str) -> Result<TokenPair, CredentialError> {
        Ok(TokenPair {
            access_token: Self::issue(owner_id, 3600),
            refresh_token: None,
        })
    }
}

/// JSON file of credentials keyed by `env/owner`. Reads and writes lock `<file>.lock` next to it.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn key(environment: &str, owner_id: &str) -> String {
        format!("{}/{}", environment, owner_id)
    }

    /// Sibling file every reader and writer locks. Locking the store itself would not
    /// hold across the rename that replaces it.
    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn lock(&self, exclusive: bool) -> Result<File, CredentialError> {
        let dir = store_dir(&self.path);
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.lock_path())?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(file)
    }

    /// Caller holds the lock.
    fn read_all(&self) -> Result<BTreeMap<String, StoredCredential>, CredentialError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let mut content = String::new();
        File::open(&self.path)?.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load(&self, environment: &str, owner_id: &str) -> Result<Option<StoredCredential>, CredentialError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let lock = self.lock(false)?;
        let all = self.read_all();
        let _ = lock.unlock();
        Ok(all?.remove(&Self::key(environment, owner_id)))
    }

    /// Read-modify-write under one exclusive lock, so concurrent saves for different
    /// keys do not drop each other.
    pub fn save(&self, environment: &str, owner_id: &str, credential: &StoredCredential) -> Result<(), CredentialError> {
        let lock = self.lock(true)?;
        let result = self.read_all().and_then(|mut all| {
            all.insert(Self::key(environment, owner_id), credential.clone());
            let content = serde_json::to_string_pretty(&all)?;
            replace_file(&self.path, &content)
        });
        let _ = lock.unlock();
        result
    }
}

fn store_dir(path: &Path) -> &Path {
    path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."))
}

fn replace_file(path: &Path, content: &str) -> Result<(), CredentialError> {
    let dir = store_dir(path);
    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("credentials.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    };
    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Cached {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Hands out a valid access token. An exchange that fails is tried once more before
/// the error reaches the caller.
pub struct CredentialManager {
    api: Arc<dyn CredentialApi>,
    store: Option<CredentialStore>,
    environment: String,
    owner_id: String,
    gateway_id: String,
    cached: Mutex<Cached>,
}

impl CredentialManager {
    pub fn new(
        api: Arc<dyn CredentialApi>,
        store: Option<CredentialStore>,
        environment: &str,
        owner_id: &str,
        gateway_id: &str,
    ) -> Self {
        let stored = store
            .as_ref()
            .and_then(|s| match s.load(environment, owner_id) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!(target: "security", "could not read stored credentials: {}", e);
                    None
                }
            })
            .unwrap_or_default();
        Self {
            api,
            store,
            environment: environment.to_string(),
            owner_id: owner_id.to_string(),
            gateway_id: gateway_id.to_string(),
            cached: Mutex::new(Cached {
                access_token: stored.access_token,
                refresh_token: stored.refresh_token,
            }),
        }
    }

    fn persist(&self, cached: &Cached) {
        let Some(store) = &self.store else { return };
        let credential = StoredCredential {
            access_token: cached.access_token.clone(),
            refresh_token: cached.refresh_token.clone(),
        };
        if let Err(e) = store.save(&self.environment, &self.owner_id, &credential) {
            log::warn!(target: "security", "could not persist credentials: {}", e);
        }
    }

    /// Current access token, exchanged first if it is missing or about to expire. A
    /// failed exchange is retried once; after a rejected refresh that retry registers.
    pub async fn access_token(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.access_token.as_deref() {
            if token_is_valid(token, now_millis()) {
                return Ok(token.to_string());
            }
        }

        match self.exchange(&mut cached).await {
            Ok(token) => Ok(token),
            Err(e) => {
                log::warn!(target: "security", "token exchange failed ({}), retrying once", e);
                self.exchange(&mut cached).await
            }
        }
    }

    async fn exchange(&self, cached: &mut Cached) -> Result<String, CredentialError> {
        metrics::inc_credential_exchanges();
        let result = match cached.refresh_token.clone() {
            Some(refresh) => {
                log::info!(target: "security", "refreshing gateway token ({})", mask_secret(&refresh));
                self.api.refresh(&refresh).await
            }
            None => {
                log::info!(target: "security", "registering gateway {} for owner {}", self.gateway_id, self.owner_id);
                self.api.register(&self.owner_id, &self.gateway_id).await
            }
        };
        match result {
            Ok(pair) => {
                cached.access_token = Some(pair.access_token.clone());
                if pair.refresh_token.is_some() {
                    cached.refresh_token = pair.refresh_token;
                }
                self.persist(cached);
                Ok(pair.access_token)
            }
            Err(CredentialError::Rejected) => {
                log::warn!(target: "security", "refresh token rejected, dropping it");
                cached.access_token = None;
                cached.refresh_token = None;
                self.persist(cached);
                Err(CredentialError::Rejected)
            }
            Err(e) => {
                cached.access_token = None;
                Err(e)
            }
        }
    }

    /// Drop the cached access token, e.g. after the broker refused it.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        cached.access_token = None;
    }

    /// Owner named by the current token, if any.
    pub async fn token_owner(&self) -> Option<String> {
        let cached = self.cached.lock().await;
        cached
            .access_token
            .as_deref()
            .and_then(TokenClaims::decode)
            .and_then(|c| c.username)
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_decode_and_leeway() {
        let token = LocalCredentialApi::issue("acme", 1200);
        let claims = TokenClaims::decode(&token).expect("claims");
        assert_eq!(claims.username.as_deref(), Some("acme"));
        // 1200 s lifetime: invalid during the last 100 s
        assert!(claims.is_valid_at(claims.exp - 101));
        assert!(!claims.is_valid_at(claims.exp - 100));
    }

    #[test]
    fn garbage_tokens_are_invalid() {
        assert!(!token_is_valid("", now_millis()));
        assert!(!token_is_valid("a.b.c", now_millis()));
    }

    #[test]
    fn store_keys_by_environment_and_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("creds.json"));
        let cred = StoredCredential {
            access_token: None,
            refresh_token: Some("r1".into()),
        };
        store.save("prod", "acme", &cred).unwrap();
        store
            .save("test", "acme", &StoredCredential::default())
            .unwrap();
        assert_eq!(store.load("prod", "acme").unwrap(), Some(cred));
        assert_eq!(store.load("prod", "other").unwrap(), None);
    }

    #[test]
    fn concurrent_saves_keep_every_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = CredentialStore::new(&path);
                std::thread::spawn(move || {
                    let cred = StoredCredential {
                        access_token: None,
                        refresh_token: Some(format!("r{}", n)),
                    };
                    for _ in 0..10 {
                        store.save("prod", &format!("owner{}", n), &cred).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let store = CredentialStore::new(&path);
        for n in 0..8 {
            let cred = store.load("prod", &format!("owner{}", n)).unwrap().unwrap();
            assert_eq!(cred.refresh_token, Some(format!("r{}", n)));
        }
        assert!(dir.path().join("creds.json.lock").exists());
    }

    #[test]
    fn local_api_registers_but_never_refreshes() {
        let api = LocalCredentialApi;
        let pair = tokio_test::block_on(api.register("acme", "GW1")).unwrap();
        assert!(token_is_valid(&pair.access_token, now_millis()));
        assert!(pair.refresh_token.is_none());
        assert!(matches!(
            tokio_test::block_on(api.refresh("r1")),
            Err(CredentialError::Rejected)
        ));
    }
}

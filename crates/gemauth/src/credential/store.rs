// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted credential store: the `get`/`set` contract plus a JSON-file
//! implementation with atomic writes and an in-memory one.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::credential::Credential;

/// Storage the broker reads its own credential from and writes renewals to.
pub trait CredentialStore: Send + Sync {
    /// Return the OAuth credential stored for `provider_id`, if any.
    fn get(
        &self,
        provider_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<Credential>>> + Send;

    /// Create or overwrite the credential for `provider_id`.
    fn set(
        &self,
        provider_id: &str,
        credential: Credential,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// One entry of the store file. Only `oauth` entries are visible to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredAuth {
    Oauth(Credential),
    Api { key: String },
}

/// JSON file store: `{ "<provider>": { "type": "oauth", ... } }`.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<HashMap<String, StoredAuth>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialStore for FileStore {
    async fn get(&self, provider_id: &str) -> anyhow::Result<Option<Credential>> {
        let entries = self.load().await?;
        Ok(match entries.get(provider_id) {
            Some(StoredAuth::Oauth(cred)) => Some(cred.clone()),
            _ => None,
        })
    }

    async fn set(&self, provider_id: &str, credential: Credential) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(provider_id.to_owned(), StoredAuth::Oauth(credential));
        save(&self.path, &entries).await?;
        debug!(path = %self.path.display(), provider = provider_id, "persisted credential");
        Ok(())
    }
}

/// Write the store atomically (unique tmp file + rename), owner-only on unix.
async fn save(path: &Path, entries: &HashMap<String, StoredAuth>) -> anyhow::Result<()> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_string_pretty(entries)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, json).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Process-local store, for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Credential>>,
    writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(provider_id: &str, credential: Credential) -> Self {
        let mut store = Self::new();
        store.entries.get_mut().insert(provider_id.to_owned(), credential);
        store
    }

    /// Number of `set` calls so far.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl CredentialStore for MemoryStore {
    async fn get(&self, provider_id: &str) -> anyhow::Result<Option<Credential>> {
        Ok(self.entries.read().await.get(provider_id).cloned())
    }

    async fn set(&self, provider_id: &str, credential: Credential) -> anyhow::Result<()> {
        self.entries.write().await.insert(provider_id.to_owned(), credential);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

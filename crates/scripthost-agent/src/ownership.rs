//! Durable map from target identifier to ownership metadata.
//!
//! The in-memory copy is authoritative for reads; every mutation is applied
//! to a clone, persisted with write-to-temp-then-rename, and only then swapped
//! in. A failed write leaves both the file and the cached copy unchanged.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use base64::Engine;
use scripthost_process::{TargetId, TargetKind};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::HostError;
use crate::json_store;

const ACCESS_KEY_BYTES: usize = 16;

/// Per-target secret gating unauthenticated status checks.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut buf = [0u8; ACCESS_KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        // URL-safe base64 without padding.
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a caller-supplied key.
    pub fn matches(&self, candidate: &str) -> bool {
        let a = self.0.as_bytes();
        let b = candidate.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl std::fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub owner: i64,
    #[serde(alias = "type")]
    pub kind: TargetKind,
    pub key: AccessKey,
    #[serde(default)]
    pub entry: Option<String>,
    // `last_run` is the field name used by older state files.
    #[serde(default, alias = "last_run")]
    pub desired_running: bool,
    #[serde(default)]
    pub created_at: i64,
}

type Records = BTreeMap<TargetId, OwnershipRecord>;

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    records: RwLock<Records>,
}

#[derive(Clone, Debug)]
pub struct OwnershipStore {
    inner: Arc<StoreInner>,
}

impl OwnershipStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records: Records = json_store::read_or_default(&path).await;
        tracing::info!(path = %path.display(), targets = records.len(), "ownership store loaded");
        Self {
            inner: Arc::new(StoreInner {
                path,
                records: RwLock::new(records),
            }),
        }
    }

    /// Apply `f` to a copy of the records and persist it if `f` reports a
    /// change. Writers are serialized by the write lock, which is held across
    /// the persist so readers never observe an unpersisted state.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Records) -> Option<R>,
    ) -> anyhow::Result<Option<R>> {
        let mut guard = self.inner.records.write().await;
        let mut next = guard.clone();
        let Some(out) = f(&mut next) else {
            return Ok(None);
        };
        json_store::write_atomic(&self.inner.path, &next).await?;
        *guard = next;
        Ok(Some(out))
    }

    fn new_record(
        owner: i64,
        kind: TargetKind,
        entry: Option<String>,
        desired_running: bool,
    ) -> OwnershipRecord {
        OwnershipRecord {
            owner,
            kind,
            key: AccessKey::generate(),
            entry,
            desired_running,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Upsert a fresh record (new access key) for `id`.
    pub async fn create(
        &self,
        id: &TargetId,
        owner: i64,
        kind: TargetKind,
        entry: Option<String>,
        desired_running: bool,
    ) -> anyhow::Result<AccessKey> {
        let rec = Self::new_record(owner, kind, entry, desired_running);
        let key = rec.key.clone();
        self.mutate(|m| {
            m.insert(id.clone(), rec);
            Some(())
        })
        .await?;
        Ok(key)
    }

    /// Create only if absent; the check and the insert happen under one lock.
    pub async fn create_new(
        &self,
        id: &TargetId,
        owner: i64,
        kind: TargetKind,
        entry: Option<String>,
        desired_running: bool,
    ) -> Result<AccessKey, HostError> {
        let rec = Self::new_record(owner, kind, entry, desired_running);
        let key = rec.key.clone();
        let inserted = self
            .mutate(|m| {
                if m.contains_key(id) {
                    return None;
                }
                m.insert(id.clone(), rec);
                Some(())
            })
            .await?;
        match inserted {
            Some(()) => Ok(key),
            None => Err(HostError::AlreadyExists(id.to_string())),
        }
    }

    pub async fn get(&self, id: &TargetId) -> Option<OwnershipRecord> {
        self.inner.records.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &TargetId) -> bool {
        self.inner.records.read().await.contains_key(id)
    }

    pub async fn set_entry(&self, id: &TargetId, entry: Option<String>) -> anyhow::Result<()> {
        self.mutate(|m| {
            let rec = m.get_mut(id)?;
            if rec.entry == entry {
                return None;
            }
            rec.entry = entry;
            Some(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_desired_running(&self, id: &TargetId, value: bool) -> anyhow::Result<()> {
        self.mutate(|m| {
            let rec = m.get_mut(id)?;
            if rec.desired_running == value {
                return None;
            }
            rec.desired_running = value;
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Move the record under `old` to `new`, optionally replacing its entry.
    /// The access key travels with the record. Returns `false` if `old` is
    /// absent.
    pub async fn rename_with_entry(
        &self,
        old: &TargetId,
        new: &TargetId,
        entry: Option<String>,
    ) -> anyhow::Result<bool> {
        let moved = self
            .mutate(|m| {
                let mut rec = m.remove(old)?;
                if entry.is_some() {
                    rec.entry = entry;
                }
                m.insert(new.clone(), rec);
                Some(())
            })
            .await?;
        Ok(moved.is_some())
    }

    pub async fn rename(&self, old: &TargetId, new: &TargetId) -> anyhow::Result<bool> {
        self.rename_with_entry(old, new, None).await
    }

    pub async fn delete(&self, id: &TargetId) -> anyhow::Result<bool> {
        let removed = self.mutate(|m| m.remove(id).map(|_| ())).await?;
        Ok(removed.is_some())
    }

    pub async fn list_all(&self) -> Vec<(TargetId, OwnershipRecord)> {
        self.inner
            .records
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn desired_running(&self) -> Vec<(TargetId, OwnershipRecord)> {
        self.inner
            .records
            .read()
            .await
            .iter()
            .filter(|(_, v)| v.desired_running)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &tempfile::TempDir) -> OwnershipStore {
        OwnershipStore::open(dir.path().join("ownership.json")).await
    }

    #[test]
    fn access_keys_are_unique_and_fixed_length() {
        let a = AccessKey::generate();
        let b = AccessKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 22);
        assert!(a.matches(a.as_str()));
        assert!(!a.matches(b.as_str()));
        assert!(!a.matches(""));
        assert_eq!(format!("{a:?}"), "AccessKey(<redacted>)");
    }

    #[tokio::test]
    async fn create_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let id = TargetId::new("u42|job.py");
        let key = {
            let store = store_in(&dir).await;
            store
                .create(&id, 42, TargetKind::UserFile, Some("job.py".into()), false)
                .await
                .unwrap()
        };

        let store = store_in(&dir).await;
        let rec = store.get(&id).await.unwrap();
        assert_eq!(rec.owner, 42);
        assert_eq!(rec.kind, TargetKind::UserFile);
        assert_eq!(rec.key, key);
        assert_eq!(rec.entry.as_deref(), Some("job.py"));
        assert!(!rec.desired_running);
        assert!(rec.created_at > 0);
    }

    #[tokio::test]
    async fn create_new_refuses_existing_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = TargetId::new("u1|a.py");
        store
            .create_new(&id, 1, TargetKind::UserFile, None, false)
            .await
            .unwrap();
        let err = store
            .create_new(&id, 1, TargetKind::UserFile, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_upserts_with_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = TargetId::new("u1|a.py");
        let k1 = store
            .create(&id, 1, TargetKind::UserFile, None, false)
            .await
            .unwrap();
        let k2 = store
            .create(&id, 1, TargetKind::UserFile, None, false)
            .await
            .unwrap();
        assert_ne!(k1, k2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn partial_updates_are_noops_for_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = TargetId::new("ghost");
        store.set_entry(&id, Some("x.py".into())).await.unwrap();
        store.set_desired_running(&id, true).await.unwrap();
        assert!(store.get(&id).await.is_none());
        assert!(!dir.path().join("ownership.json").exists());
    }

    #[tokio::test]
    async fn set_entry_keeps_access_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = TargetId::new("bot_u1|PLACEHOLDER");
        let key = store
            .create(&id, 1, TargetKind::RepoFile, None, false)
            .await
            .unwrap();
        store.set_entry(&id, Some("main.py".into())).await.unwrap();
        store.set_desired_running(&id, true).await.unwrap();
        let rec = store.get(&id).await.unwrap();
        assert_eq!(rec.key, key);
        assert_eq!(rec.entry.as_deref(), Some("main.py"));
        assert!(rec.desired_running);
    }

    #[tokio::test]
    async fn rename_moves_record_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let old = TargetId::new("bot_u1|PLACEHOLDER");
        let new = TargetId::new("bot_u1|src/main.py");
        let key = store
            .create(&old, 1, TargetKind::RepoFile, None, false)
            .await
            .unwrap();

        assert!(
            store
                .rename_with_entry(&old, &new, Some("src/main.py".into()))
                .await
                .unwrap()
        );
        assert!(store.get(&old).await.is_none());
        let rec = store.get(&new).await.unwrap();
        assert_eq!(rec.key, key);
        assert_eq!(rec.entry.as_deref(), Some("src/main.py"));

        assert!(!store.rename(&old, &new).await.unwrap());
    }

    #[tokio::test]
    async fn delete_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let a = TargetId::new("u1|a.py");
        let b = TargetId::new("u2|b.py");
        store
            .create(&a, 1, TargetKind::UserFile, None, true)
            .await
            .unwrap();
        store
            .create(&b, 2, TargetKind::UserFile, None, false)
            .await
            .unwrap();

        let desired: Vec<_> = store
            .desired_running()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(desired, vec![a.clone()]);

        assert!(store.delete(&a).await.unwrap());
        assert!(!store.delete(&a).await.unwrap());
        assert_eq!(store.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_backing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("ownership.json"), b"[[[")
            .await
            .unwrap();
        let store = store_in(&dir).await;
        assert_eq!(store.len().await, 0);

        store
            .create(&TargetId::new("x"), 1, TargetKind::Legacy, None, false)
            .await
            .unwrap();
        assert_eq!(store_in(&dir).await.len().await, 1);
    }

    #[tokio::test]
    async fn reads_older_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = r#"{"u5|bot.py":{"owner":5,"type":"file","key":"abc","last_run":true,"entry":"bot.py","created_at":1700000000}}"#;
        tokio::fs::write(dir.path().join("ownership.json"), legacy)
            .await
            .unwrap();
        let store = store_in(&dir).await;
        let rec = store.get(&TargetId::new("u5|bot.py")).await.unwrap();
        assert!(rec.desired_running);
        assert_eq!(rec.kind, TargetKind::UserFile);
        assert!(rec.key.matches("abc"));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let id = TargetId::new(format!("u{i}|a.py"));
                store
                    .create(&id, i, TargetKind::UserFile, None, false)
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.len().await, 16);
        assert_eq!(store_in(&dir).await.len().await, 16);
    }
}

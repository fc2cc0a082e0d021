//! Facade used by collaborators (chat handlers, HTTP routes).
//!
//! Every per-target operation is gated here: status checks by access key,
//! management by owner or administrator identity.

use std::sync::Arc;

use anyhow::Context;
use scripthost_process::{TargetId, TargetKind, TargetStatus, within};
use serde::Serialize;

use crate::access::AllowList;
use crate::config::HostConfig;
use crate::env_file;
use crate::error::HostError;
use crate::ownership::{AccessKey, OwnershipRecord, OwnershipStore};
use crate::process_manager::{AutoStartReport, ProcessManager, StartOutcome};
use crate::registry::ProcessRegistry;
use crate::run_command::{LISTING_MAX_FILES, is_runnable_name, list_runnable_files};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSummary {
    pub id: TargetId,
    pub owner: i64,
    pub running: bool,
    pub desired_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub total: usize,
    pub running: usize,
}

fn into_host_error(e: anyhow::Error) -> HostError {
    match e.downcast::<HostError>() {
        Ok(h) => h,
        Err(e) => HostError::Internal(e),
    }
}

#[derive(Clone, Debug)]
pub struct HostService {
    cfg: Arc<HostConfig>,
    store: OwnershipStore,
    access: AllowList,
    manager: ProcessManager,
}

impl HostService {
    pub async fn open(cfg: HostConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&cfg.data_root)
            .await
            .with_context(|| format!("create data root {}", cfg.data_root.display()))?;
        let cfg = Arc::new(cfg);
        let store = OwnershipStore::open(cfg.ownership_file()).await;
        let access = AllowList::open(cfg.allowlist_file(), cfg.admin_id).await;
        let manager = ProcessManager::new(cfg.clone(), store.clone(), ProcessRegistry::new());
        Ok(Self {
            cfg,
            store,
            access,
            manager,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.cfg
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    pub fn store(&self) -> &OwnershipStore {
        &self.store
    }

    pub fn access(&self) -> &AllowList {
        &self.access
    }

    /// Record for `id` if `caller` owns it or is the administrator.
    async fn authorize(&self, id: &TargetId, caller: i64) -> Result<OwnershipRecord, HostError> {
        let rec = self.store.get(id).await.ok_or(HostError::Forbidden)?;
        if rec.owner != caller && !self.access.is_admin(caller) {
            return Err(HostError::Forbidden);
        }
        Ok(rec)
    }

    fn require_admin(&self, caller: i64) -> Result<(), HostError> {
        if self.access.is_admin(caller) {
            Ok(())
        } else {
            Err(HostError::Forbidden)
        }
    }

    /// Register a target whose files a collaborator has already placed on
    /// disk. `name` is the uploaded filename, the repository name, or the
    /// bare legacy identifier depending on `kind`.
    pub async fn create_target(
        &self,
        kind: TargetKind,
        owner: i64,
        name: &str,
    ) -> Result<(TargetId, AccessKey), HostError> {
        let id = match kind {
            TargetKind::UserFile => TargetId::user_file(owner, name),
            TargetKind::RepoFile => TargetId::repo_placeholder(name),
            TargetKind::Legacy => TargetId::legacy(name),
        }
        .map_err(|e| HostError::InvalidTarget(e.to_string()))?;

        let locs = id.locations(&self.cfg.data_root);
        if !locs.is_contained(&self.cfg.data_root) {
            return Err(HostError::PathEscape(id.to_string()));
        }

        let entry = match kind {
            TargetKind::RepoFile => None,
            _ => Some(locs.relative_entry),
        };
        let key = self
            .store
            .create(&id, owner, kind, entry, false)
            .await
            .map_err(into_host_error)?;
        tracing::info!(tid = %id, owner, op = "create", "target registered");
        Ok((id, key))
    }

    /// Bind a repository placeholder to the entry file the user picked. The
    /// record (and its access key) moves to the concrete identifier. A
    /// process still running under the placeholder is stopped first, so the
    /// moved record starts out not desired-running.
    pub async fn select_entry(
        &self,
        placeholder: &TargetId,
        caller: i64,
        rel_path: &str,
    ) -> Result<TargetId, HostError> {
        if !placeholder.is_placeholder() {
            return Err(HostError::InvalidTarget(placeholder.to_string()));
        }
        self.authorize(placeholder, caller).await?;
        let repo = placeholder
            .repo_name()
            .ok_or_else(|| HostError::InvalidTarget(placeholder.to_string()))?;
        let new_id = TargetId::repo_file(repo, rel_path)
            .map_err(|e| HostError::InvalidTarget(e.to_string()))?;

        let locs = new_id.locations(&self.cfg.data_root);
        if !locs.is_contained(&self.cfg.data_root) {
            return Err(HostError::PathEscape(rel_path.to_string()));
        }
        if !is_runnable_name(rel_path) || !locs.entry_path.is_file() {
            return Err(HostError::NotFound(rel_path.to_string()));
        }

        self.manager
            .stop(placeholder)
            .await
            .map_err(into_host_error)?;
        let moved = self
            .store
            .rename_with_entry(placeholder, &new_id, Some(rel_path.to_string()))
            .await
            .map_err(into_host_error)?;
        if !moved {
            return Err(HostError::Forbidden);
        }
        tracing::info!(from = %placeholder, tid = %new_id, op = "select_entry", "entry selected");
        Ok(new_id)
    }

    /// Key-gated status. A wrong key and an unknown target look the same.
    pub async fn status(&self, id: &TargetId, key: &str) -> Result<TargetStatus, HostError> {
        match self.store.get(id).await {
            Some(rec) if rec.key.matches(key) => Ok(self.manager.status(id).await),
            _ => Err(HostError::Forbidden),
        }
    }

    pub fn status_url(&self, id: &TargetId, key: &AccessKey) -> String {
        format!(
            "{}/status?script={}&key={}",
            self.cfg.public_url,
            urlencoding::encode(id.as_str()),
            urlencoding::encode(key.as_str())
        )
    }

    pub async fn tail_log(
        &self,
        id: &TargetId,
        caller: i64,
        lines: usize,
    ) -> Result<String, HostError> {
        self.authorize(id, caller).await?;
        Ok(self.manager.tail_log(id, lines).await)
    }

    /// Every target for the administrator, otherwise only the caller's own.
    pub async fn list_for_caller(&self, caller: i64) -> Vec<TargetSummary> {
        let admin = self.access.is_admin(caller);
        let mut out = Vec::new();
        for (id, rec) in self.store.list_all().await {
            if !admin && rec.owner != caller {
                continue;
            }
            out.push(TargetSummary {
                running: self.manager.is_running(&id).await,
                id,
                owner: rec.owner,
                desired_running: rec.desired_running,
            });
        }
        out
    }

    /// (Re)start `id`. Nothing runnable is reported as
    /// `HostError::NoRunnableEntry`, so an `Ok` outcome is always `Started`.
    pub async fn restart(&self, id: &TargetId, caller: i64) -> Result<StartOutcome, HostError> {
        self.authorize(id, caller).await?;
        match self.manager.start(id).await.map_err(into_host_error)? {
            StartOutcome::NoRunnableEntry => Err(HostError::NoRunnableEntry(id.to_string())),
            started => Ok(started),
        }
    }

    pub async fn stop(&self, id: &TargetId, caller: i64) -> Result<(), HostError> {
        self.authorize(id, caller).await?;
        self.manager.stop(id).await.map_err(into_host_error)
    }

    pub async fn clear_log(&self, id: &TargetId, caller: i64) -> Result<(), HostError> {
        self.authorize(id, caller).await?;
        self.manager.clear_log(id).await;
        Ok(())
    }

    pub async fn append_env(&self, id: &TargetId, caller: i64, text: &str) -> Result<(), HostError> {
        self.authorize(id, caller).await?;
        let locs = id.locations(&self.cfg.data_root);
        if !within(&self.cfg.data_root, &locs.env_file) {
            return Err(HostError::PathEscape(id.to_string()));
        }
        env_file::append(&locs.env_file, text)
            .await
            .map_err(into_host_error)
    }

    pub async fn list_runnable_files(
        &self,
        id: &TargetId,
        caller: i64,
    ) -> Result<Vec<String>, HostError> {
        self.authorize(id, caller).await?;
        let locs = id.locations(&self.cfg.data_root);
        if !within(&self.cfg.data_root, &locs.work_dir) {
            return Err(HostError::PathEscape(id.to_string()));
        }
        let work_dir = locs.work_dir;
        tokio::task::spawn_blocking(move || list_runnable_files(&work_dir, LISTING_MAX_FILES))
            .await
            .map_err(|e| HostError::Internal(e.into()))
    }

    /// Stop the target, forget it, and remove its files from disk.
    pub async fn delete_target(&self, id: &TargetId, caller: i64) -> Result<(), HostError> {
        self.authorize(id, caller).await?;
        self.manager.stop(id).await.map_err(into_host_error)?;
        self.store.delete(id).await.map_err(into_host_error)?;
        self.manager.registry().forget_alerts(id).await;

        let root = &self.cfg.data_root;
        let locs = id.locations(root);
        let res = match id.kind() {
            TargetKind::RepoFile => {
                if within(root, &locs.work_dir) && locs.work_dir != *root {
                    tokio::fs::remove_dir_all(&locs.work_dir).await
                } else {
                    Ok(())
                }
            }
            TargetKind::UserFile | TargetKind::Legacy => {
                if within(&locs.work_dir, &locs.entry_path) && locs.entry_path != locs.work_dir {
                    tokio::fs::remove_file(&locs.entry_path).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = res
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(tid = %id, op = "delete", error = %e, "failed to remove target files");
        }
        tracing::info!(tid = %id, op = "delete", "target deleted");
        Ok(())
    }

    // Administrator operations.

    pub async fn stop_all(&self, caller: i64) -> Result<usize, HostError> {
        self.require_admin(caller)?;
        Ok(self.manager.stop_all().await)
    }

    pub async fn restart_desired(&self, caller: i64) -> Result<AutoStartReport, HostError> {
        self.require_admin(caller)?;
        Ok(self.manager.auto_start_desired().await)
    }

    pub async fn stats(&self) -> HostStats {
        HostStats {
            total: self.store.len().await,
            running: self.manager.registry().running_count().await,
        }
    }

    pub async fn running_targets(&self, caller: i64) -> Result<Vec<TargetId>, HostError> {
        self.require_admin(caller)?;
        let mut out = Vec::new();
        for (id, _) in self.store.list_all().await {
            if self.manager.is_running(&id).await {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Targets that should be running but are not.
    pub async fn down_targets(&self, caller: i64) -> Result<Vec<TargetId>, HostError> {
        self.require_admin(caller)?;
        let mut out = Vec::new();
        for (id, _) in self.store.desired_running().await {
            if !self.manager.is_running(&id).await {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub async fn access_list(&self, caller: i64) -> Result<Vec<i64>, HostError> {
        self.require_admin(caller)?;
        Ok(self.access.list().await)
    }

    pub async fn allow_user(&self, caller: i64, uid: i64) -> Result<bool, HostError> {
        self.require_admin(caller)?;
        self.access.add(uid).await.map_err(into_host_error)
    }

    pub async fn revoke_user(&self, caller: i64, uid: i64) -> Result<bool, HostError> {
        self.require_admin(caller)?;
        self.access.remove(uid).await.map_err(into_host_error)
    }

    pub async fn is_authorized(&self, uid: i64) -> bool {
        self.access.is_authorized(uid).await
    }

    /// Boot-time restore of targets that were running before the host went
    /// down.
    pub async fn restore(&self) -> AutoStartReport {
        let report = self.manager.auto_start_desired().await;
        for (id, err) in &report.failed {
            tracing::warn!(tid = %id, op = "auto_start", error = %err, "target not restored");
        }
        report
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        tracing::info!("managed targets terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: i64 = 1;

    async fn service(dir: &tempfile::TempDir) -> HostService {
        let mut cfg = HostConfig::with_root(dir.path());
        cfg.admin_id = ADMIN;
        cfg.python = "sh".to_string();
        cfg.public_url = "https://host.example".to_string();
        HostService::open(cfg).await.unwrap()
    }

    fn put(svc: &HostService, rel: &str, body: &str) {
        let p = svc.config().data_root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    #[tokio::test]
    async fn status_requires_matching_key() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, key) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "u42|job.py");

        let st = svc.status(&id, key.as_str()).await.unwrap();
        assert!(!st.running());
        assert!(matches!(
            svc.status(&id, "wrong").await,
            Err(HostError::Forbidden)
        ));
        assert!(matches!(
            svc.status(&TargetId::new("u9|nope.py"), key.as_str()).await,
            Err(HostError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn status_url_is_percent_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, key) = svc
            .create_target(TargetKind::UserFile, 42, "my job.py")
            .await
            .unwrap();
        let url = svc.status_url(&id, &key);
        assert!(url.starts_with("https://host.example/status?script=u42%7Cmy%20job.py&key="));
    }

    #[tokio::test]
    async fn bad_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        assert!(matches!(
            svc.create_target(TargetKind::UserFile, 1, "").await,
            Err(HostError::InvalidTarget(_))
        ));
        assert!(svc
            .create_target(TargetKind::UserFile, 1, "../../escape.py")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn management_is_owner_or_admin_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();

        assert!(matches!(svc.stop(&id, 7).await, Err(HostError::Forbidden)));
        assert!(matches!(
            svc.tail_log(&id, 7, 100).await,
            Err(HostError::Forbidden)
        ));
        assert_eq!(svc.tail_log(&id, 42, 100).await.unwrap(), crate::process_manager::NO_LOGS);
        svc.clear_log(&id, ADMIN).await.unwrap();
        svc.stop(&id, 42).await.unwrap();
    }

    #[tokio::test]
    async fn list_for_caller_scopes_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_target(TargetKind::UserFile, 42, "a.py")
            .await
            .unwrap();
        svc.create_target(TargetKind::UserFile, 43, "b.py")
            .await
            .unwrap();

        let mine = svc.list_for_caller(42).await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id.as_str(), "u42|a.py");
        assert!(!mine[0].running);
        assert_eq!(svc.list_for_caller(ADMIN).await.len(), 2);
        assert!(svc.list_for_caller(99).await.is_empty());
    }

    #[tokio::test]
    async fn select_entry_moves_record_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (placeholder, key) = svc
            .create_target(TargetKind::RepoFile, 5, "bot_u5")
            .await
            .unwrap();
        assert!(placeholder.is_placeholder());
        put(&svc, "bot_u5/src/main.py", "exec sleep 30\n");
        put(&svc, "bot_u5/README.md", "");

        assert_eq!(
            svc.list_runnable_files(&placeholder, 5).await.unwrap(),
            vec!["src/main.py".to_string()]
        );
        assert!(matches!(
            svc.select_entry(&placeholder, 5, "README.md").await,
            Err(HostError::NotFound(_))
        ));
        assert!(matches!(
            svc.select_entry(&placeholder, 6, "src/main.py").await,
            Err(HostError::Forbidden)
        ));

        let id = svc
            .select_entry(&placeholder, 5, "src/main.py")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "bot_u5|src/main.py");
        assert!(svc.store().get(&placeholder).await.is_none());
        let rec = svc.store().get(&id).await.unwrap();
        assert_eq!(rec.key, key);
        assert_eq!(rec.entry.as_deref(), Some("src/main.py"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn select_entry_stops_process_running_under_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (placeholder, _) = svc
            .create_target(TargetKind::RepoFile, 5, "bot_u5")
            .await
            .unwrap();
        put(&svc, "bot_u5/main.py", "exec sleep 30\n");
        put(&svc, "bot_u5/worker.py", "exec sleep 30\n");

        assert!(svc.restart(&placeholder, 5).await.unwrap().is_started());
        assert!(svc.manager().is_running(&placeholder).await);

        let id = svc
            .select_entry(&placeholder, 5, "worker.py")
            .await
            .unwrap();
        assert!(!svc.manager().registry().contains(&placeholder).await);
        assert!(!svc.store().get(&id).await.unwrap().desired_running);
        assert_eq!(svc.stats().await.running, 0);
    }

    #[tokio::test]
    async fn restart_without_runnable_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (placeholder, _) = svc
            .create_target(TargetKind::RepoFile, 5, "empty_u5")
            .await
            .unwrap();
        put(&svc, "empty_u5/README.md", "");

        let err = svc.restart(&placeholder, 5).await.unwrap_err();
        assert!(matches!(err, HostError::NoRunnableEntry(_)), "{err:?}");
        assert_eq!(err.status_code(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!svc.manager().registry().contains(&placeholder).await);
    }

    #[tokio::test]
    async fn append_env_writes_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();
        svc.append_env(&id, 42, "TOKEN=abc").await.unwrap();
        let env = env_file::load(&svc.config().data_root.join("42/.env")).await;
        assert_eq!(env, vec![("TOKEN".to_string(), "abc".to_string())]);
        assert!(matches!(
            svc.append_env(&id, 7, "X=1").await,
            Err(HostError::Forbidden)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_stops_and_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        put(&svc, "42/job.py", "exec sleep 30\n");
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();
        assert!(svc.restart(&id, 42).await.unwrap().is_started());
        assert_eq!(svc.stats().await, HostStats { total: 1, running: 1 });

        svc.delete_target(&id, 42).await.unwrap();
        assert!(svc.store().get(&id).await.is_none());
        assert!(!svc.manager().registry().contains(&id).await);
        assert!(!svc.config().data_root.join("42/job.py").exists());
        assert_eq!(svc.stats().await, HostStats { total: 0, running: 0 });
    }

    #[tokio::test]
    async fn admin_views_and_access_list() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "gone.py")
            .await
            .unwrap();
        svc.store().set_desired_running(&id, true).await.unwrap();

        assert_eq!(svc.down_targets(ADMIN).await.unwrap(), vec![id]);
        assert!(svc.running_targets(ADMIN).await.unwrap().is_empty());
        assert!(matches!(
            svc.down_targets(42).await,
            Err(HostError::Forbidden)
        ));

        assert!(!svc.is_authorized(42).await);
        assert!(svc.allow_user(ADMIN, 42).await.unwrap());
        assert!(svc.is_authorized(42).await);
        assert_eq!(svc.access_list(ADMIN).await.unwrap(), vec![42]);
        assert!(matches!(
            svc.allow_user(42, 43).await,
            Err(HostError::Forbidden)
        ));
        assert!(svc.revoke_user(ADMIN, 42).await.unwrap());
        assert_eq!(svc.stop_all(ADMIN).await.unwrap(), 0);
    }
}

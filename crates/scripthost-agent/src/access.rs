use std::{path::PathBuf, sync::Arc};

use tokio::sync::RwLock;

use crate::json_store;

/// Globally allow-listed caller ids. The administrator is always allowed and
/// is never stored in the list.
#[derive(Clone, Debug)]
pub struct AllowList {
    path: Arc<PathBuf>,
    admin_id: i64,
    users: Arc<RwLock<Vec<i64>>>,
}

impl AllowList {
    pub async fn open(path: impl Into<PathBuf>, admin_id: i64) -> Self {
        let path = path.into();
        let users: Vec<i64> = json_store::read_or_default(&path).await;
        Self {
            path: Arc::new(path),
            admin_id,
            users: Arc::new(RwLock::new(users)),
        }
    }

    pub fn admin_id(&self) -> i64 {
        self.admin_id
    }

    /// An unset administrator id (0) matches nobody.
    pub fn is_admin(&self, uid: i64) -> bool {
        self.admin_id != 0 && uid == self.admin_id
    }

    pub async fn is_authorized(&self, uid: i64) -> bool {
        self.is_admin(uid) || self.users.read().await.contains(&uid)
    }

    pub async fn list(&self) -> Vec<i64> {
        self.users.read().await.clone()
    }

    /// Returns `false` if `uid` was already allowed.
    pub async fn add(&self, uid: i64) -> anyhow::Result<bool> {
        let mut guard = self.users.write().await;
        if guard.contains(&uid) {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.push(uid);
        json_store::write_atomic(&self.path, &next).await?;
        *guard = next;
        Ok(true)
    }

    /// Returns `false` if `uid` was not in the list.
    pub async fn remove(&self, uid: i64) -> anyhow::Result<bool> {
        let mut guard = self.users.write().await;
        if !guard.contains(&uid) {
            return Ok(false);
        }
        let next: Vec<i64> = guard.iter().copied().filter(|u| *u != uid).collect();
        json_store::write_atomic(&self.path, &next).await?;
        *guard = next;
        Ok(true)
    }
}

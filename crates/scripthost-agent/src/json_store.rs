use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;

/// Read a JSON document. A missing, unreadable or invalid file yields
/// `T::default()` so a damaged state file never takes the host down.
pub(crate) async fn read_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let raw = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "state file unreadable; using empty state");
            return T::default();
        }
    };
    match serde_json::from_slice::<T>(&raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "state file corrupt; using empty state");
            T::default()
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write-to-temp then rename. Readers of `path` see either the old or the new
/// document, never a partial one.
pub(crate) async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }

    let tmp = tmp_path(path);
    let data = serde_json::to_vec_pretty(value).context("serialize state")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush().await.ok();
    f.sync_all()
        .await
        .with_context(|| format!("sync {}", tmp.display()))?;
    drop(f);

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

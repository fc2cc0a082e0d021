//! Volatile map of targets this host instance has spawned.
//!
//! An entry's presence does not mean the process is alive; liveness is always
//! polled from the handle. Alert stamps live beside the entries so a crash
//! loop keeps its cooldown across restarts. Each alert kind has its own stamp.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use scripthost_process::{TargetId, TargetState};
use tokio::{sync::Mutex, time::Instant};

use crate::process_manager_support::{cpu_percent, read_proc_cpu_ticks, read_proc_rss_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Down,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
}

/// Handle on a spawned process group.
pub trait ProcessHandle: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// One-shot non-blocking poll. Reaps the child if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Signal the whole group. A group that is already gone counts as success.
    fn signal_group(&mut self, signal: GroupSignal) -> std::io::Result<()>;
}

/// A child spawned as the leader of its own session/process group.
#[derive(Debug)]
pub struct ChildHandle {
    child: tokio::process::Child,
    pgid: Option<i32>,
}

impl ChildHandle {
    pub fn new(child: tokio::process::Child) -> Self {
        let pgid = child.id().map(|p| p as i32);
        Self { child, pgid }
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn signal_group(&mut self, signal: GroupSignal) -> std::io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            let sig = match signal {
                GroupSignal::Terminate => libc::SIGTERM,
                GroupSignal::Kill => libc::SIGKILL,
            };
            crate::process_manager_support::signal_group(pgid, sig)
        }
        #[cfg(not(unix))]
        {
            let _ = (pgid, signal);
            self.child.start_kill()
        }
    }
}

pub struct RegistryEntry {
    pub handle: Box<dyn ProcessHandle>,
    pub log_path: PathBuf,
    pub started_at: chrono::DateTime<chrono::Utc>,
    cpu_sample: Option<(u64, Instant)>,
}

impl RegistryEntry {
    pub fn new(handle: Box<dyn ProcessHandle>, log_path: PathBuf) -> Self {
        Self {
            handle,
            log_path,
            started_at: chrono::Utc::now(),
            cpu_sample: None,
        }
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("pid", &self.handle.pid())
            .field("log_path", &self.log_path)
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

impl ResourceSample {
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<TargetId, RegistryEntry>,
    last_alert: HashMap<(TargetId, AlertKind), Instant>,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, returning whatever was registered before.
    pub async fn insert(&self, id: TargetId, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.inner.lock().await.entries.insert(id, entry)
    }

    pub async fn remove(&self, id: &TargetId) -> Option<RegistryEntry> {
        self.inner.lock().await.entries.remove(id)
    }

    pub async fn contains(&self, id: &TargetId) -> bool {
        self.inner.lock().await.entries.contains_key(id)
    }

    pub async fn is_alive(&self, id: &TargetId) -> bool {
        let mut st = self.inner.lock().await;
        st.entries
            .get_mut(id)
            .is_some_and(|e| e.handle.is_alive())
    }

    pub async fn state(&self, id: &TargetId) -> TargetState {
        let mut st = self.inner.lock().await;
        match st.entries.get_mut(id) {
            None => TargetState::Unmanaged,
            Some(e) => {
                if e.handle.is_alive() {
                    TargetState::Running
                } else {
                    TargetState::Stopped
                }
            }
        }
    }

    pub async fn pid(&self, id: &TargetId) -> Option<u32> {
        self.inner
            .lock()
            .await
            .entries
            .get(id)
            .and_then(|e| e.handle.pid())
    }

    pub async fn log_path(&self, id: &TargetId) -> Option<PathBuf> {
        self.inner
            .lock()
            .await
            .entries
            .get(id)
            .map(|e| e.log_path.clone())
    }

    pub async fn ids(&self) -> Vec<TargetId> {
        self.inner.lock().await.entries.keys().cloned().collect()
    }

    pub async fn running_count(&self) -> usize {
        let mut st = self.inner.lock().await;
        st.entries
            .values_mut()
            .filter_map(|e| e.handle.is_alive().then_some(()))
            .count()
    }

    /// True when no `kind` alert was sent for `id` within `cooldown` of `now`.
    pub async fn alert_due(
        &self,
        id: &TargetId,
        kind: AlertKind,
        cooldown: Duration,
        now: Instant,
    ) -> bool {
        match self.inner.lock().await.last_alert.get(&(id.clone(), kind)) {
            None => true,
            Some(last) => now.saturating_duration_since(*last) >= cooldown,
        }
    }

    pub async fn mark_alerted(&self, id: &TargetId, kind: AlertKind, now: Instant) {
        self.inner
            .lock()
            .await
            .last_alert
            .insert((id.clone(), kind), now);
    }

    pub async fn forget_alerts(&self, id: &TargetId) {
        self.inner
            .lock()
            .await
            .last_alert
            .retain(|(t, _), _| t != id);
    }

    /// Sample CPU and resident memory of the registered process.
    ///
    /// CPU is measured against the previous sample of the same entry; the
    /// first sample after a spawn reports 0%.
    pub async fn sample(&self, id: &TargetId) -> anyhow::Result<ResourceSample> {
        let pid = self
            .pid(id)
            .await
            .ok_or_else(|| anyhow::anyhow!("no live pid for {id}"))?;

        let now = Instant::now();
        let ticks = read_proc_cpu_ticks(pid)
            .await
            .ok_or_else(|| anyhow::anyhow!("cpu stats unavailable for pid {pid}"))?;
        let rss_bytes = read_proc_rss_bytes(pid)
            .await
            .ok_or_else(|| anyhow::anyhow!("memory stats unavailable for pid {pid}"))?;

        let mut st = self.inner.lock().await;
        let e = st
            .entries
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("{id} left the registry while sampling"))?;
        if e.handle.pid() != Some(pid) {
            anyhow::bail!("{id} was restarted while sampling");
        }
        let cpu = e
            .cpu_sample
            .map(|(prev_ticks, prev_at)| cpu_percent(prev_ticks, prev_at, ticks, now))
            .unwrap_or(0.0);
        e.cpu_sample = Some((ticks, now));

        Ok(ResourceSample {
            cpu_percent: cpu,
            rss_bytes,
        })
    }
}

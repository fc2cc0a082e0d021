use std::{
    collections::{HashMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::Context;
use scripthost_process::{TargetId, TargetKind, TargetState, TargetStatus, within};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    process::Command,
    sync::Mutex,
};

use crate::config::{HostConfig, LogLimits};
use crate::env_file;
use crate::error::HostError;
use crate::ownership::OwnershipStore;
#[cfg(unix)]
use crate::process_manager_support::set_parent_death_signal;
use crate::process_manager_support::format_error_chain;
use crate::registry::{ChildHandle, GroupSignal, ProcessRegistry, RegistryEntry};
use crate::run_command::{RunCommand, resolve_run_command};

pub const TAIL_MIN_LINES: usize = 50;
pub const TAIL_MAX_LINES: usize = 800;
pub const NO_LOGS: &str = "No logs.";
pub const EMPTY_LOG: &str = "(empty)";

// Upper bound on bytes read from the end of a log for one tail request.
const TAIL_WINDOW_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32>, argv: Vec<String> },
    /// Nothing runnable was found; no process was spawned.
    NoRunnableEntry,
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

/// What the watchdog needs from the lifecycle layer.
pub trait Lifecycle: Send + Sync + 'static {
    /// Restart `id` unless its desired-running flag was cleared in the
    /// meantime, in which case `None` is returned and nothing is spawned.
    fn restart_if_desired(
        &self,
        id: &TargetId,
    ) -> impl Future<Output = anyhow::Result<Option<StartOutcome>>> + Send;
}

#[derive(Debug, Default, Clone)]
pub struct AutoStartReport {
    pub started: Vec<TargetId>,
    pub skipped: Vec<TargetId>,
    pub failed: Vec<(TargetId, String)>,
}

struct ManagerInner {
    cfg: Arc<HostConfig>,
    store: OwnershipStore,
    registry: ProcessRegistry,
    op_locks: Mutex<HashMap<TargetId, Arc<Mutex<()>>>>,
    starting: Mutex<HashSet<TargetId>>,
}

/// Starts, stops and inspects managed targets.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("data_root", &self.inner.cfg.data_root)
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    pub fn new(cfg: Arc<HostConfig>, store: OwnershipStore, registry: ProcessRegistry) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cfg,
                store,
                registry,
                op_locks: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.cfg
    }

    pub fn store(&self) -> &OwnershipStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn log_path(&self, id: &TargetId) -> PathBuf {
        self.inner.cfg.data_root.join(id.log_file_name())
    }

    async fn op_lock(&self, id: &TargetId) -> Arc<Mutex<()>> {
        self.inner
            .op_locks
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .clone()
    }

    pub async fn state(&self, id: &TargetId) -> TargetState {
        if self.inner.starting.lock().await.contains(id) {
            return TargetState::Starting;
        }
        self.inner.registry.state(id).await
    }

    pub async fn status(&self, id: &TargetId) -> TargetStatus {
        let state = self.state(id).await;
        let pid = match state {
            TargetState::Running => self.inner.registry.pid(id).await,
            _ => None,
        };
        TargetStatus {
            id: id.clone(),
            state,
            pid,
        }
    }

    pub async fn is_running(&self, id: &TargetId) -> bool {
        self.inner.registry.is_alive(id).await
    }

    /// (Re)start `id`. Any process already registered for it is terminated
    /// first and its entry cleared before the new one is spawned.
    pub async fn start(&self, id: &TargetId) -> anyhow::Result<StartOutcome> {
        let lock = self.op_lock(id).await;
        let _guard = lock.lock().await;
        self.start_guarded(id).await
    }

    /// Like `start`, but the desired-running flag is re-read under the op
    /// lock so a `stop` that raced the caller wins.
    pub async fn restart_if_desired(&self, id: &TargetId) -> anyhow::Result<Option<StartOutcome>> {
        let lock = self.op_lock(id).await;
        let _guard = lock.lock().await;
        let desired = self
            .inner
            .store
            .get(id)
            .await
            .is_some_and(|r| r.desired_running);
        if !desired {
            tracing::debug!(tid = %id, op = "start", "desired-running cleared; restart skipped");
            return Ok(None);
        }
        self.start_guarded(id).await.map(Some)
    }

    // Caller holds the op lock for `id`.
    async fn start_guarded(&self, id: &TargetId) -> anyhow::Result<StartOutcome> {
        self.inner.starting.lock().await.insert(id.clone());
        let res = self.start_locked(id).await;
        self.inner.starting.lock().await.remove(id);

        match &res {
            Ok(StartOutcome::Started { pid, argv }) => {
                tracing::info!(tid = %id, op = "start", pid = ?pid, cmd = %argv.join(" "), "target started");
            }
            Ok(StartOutcome::NoRunnableEntry) => {
                tracing::warn!(tid = %id, op = "start", "no runnable entry found");
            }
            Err(e) => {
                tracing::warn!(tid = %id, op = "start", error = %format_error_chain(e), "start failed");
            }
        }
        res
    }

    async fn start_locked(&self, id: &TargetId) -> anyhow::Result<StartOutcome> {
        let cfg = &self.inner.cfg;
        self.terminate(id, "restart").await;

        let locs = id.locations(&cfg.data_root);
        if !locs.is_contained(&cfg.data_root) {
            return Err(HostError::PathEscape(id.to_string()).into());
        }

        let stored_entry = self.inner.store.get(id).await.and_then(|r| r.entry);
        let entry = stored_entry.clone().or_else(|| match id.kind() {
            TargetKind::UserFile | TargetKind::Legacy => Some(locs.relative_entry.clone()),
            TargetKind::RepoFile if !id.is_placeholder() => Some(locs.relative_entry.clone()),
            TargetKind::RepoFile => None,
        });
        if let Some(e) = entry.as_deref()
            && !within(&locs.work_dir, &locs.work_dir.join(e))
        {
            return Err(HostError::PathEscape(e.to_string()).into());
        }

        let Some(cmd) = resolve_run_command(&locs.work_dir, entry.as_deref(), &cfg.python) else {
            return Ok(StartOutcome::NoRunnableEntry);
        };
        self.remember_entry(id, stored_entry.as_deref(), &cmd).await;

        tokio::fs::create_dir_all(&locs.work_dir)
            .await
            .with_context(|| format!("create work dir {}", locs.work_dir.display()))?;
        let overrides = env_file::load(&locs.env_file).await;

        let log_path = self.log_path(id);
        rotate_if_oversized(&log_path, cfg.log_limits).await;
        let mut log = open_log(&log_path).await?;
        log.write_all(
            format!(
                "[scripthost] exec: {} (cwd {})\n",
                cmd.argv.join(" "),
                locs.work_dir.display()
            )
            .as_bytes(),
        )
        .await?;
        log.flush().await?;
        let stdout = log.into_std().await;
        let stderr = stdout.try_clone().context("duplicate log handle")?;

        let (program, args) = cmd
            .argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty command line"))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&locs.work_dir)
            .envs(overrides)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        {
            unsafe {
                command.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawn {program} (cwd {})", locs.work_dir.display()))?;
        let pid = child.id();

        let entry = RegistryEntry::new(Box::new(ChildHandle::new(child)), log_path);
        if let Some(mut prev) = self.inner.registry.insert(id.clone(), entry).await {
            // Only reachable if someone bypassed the op lock.
            let _ = prev.handle.signal_group(GroupSignal::Kill);
        }

        self.inner
            .store
            .set_desired_running(id, true)
            .await
            .context("persist desired-running")?;

        Ok(StartOutcome::Started {
            pid,
            argv: cmd.argv,
        })
    }

    /// A discovered entry is only written when none was stored; a stored
    /// choice is never replaced by discovery.
    async fn remember_entry(&self, id: &TargetId, stored: Option<&str>, cmd: &RunCommand) {
        let Some(found) = cmd.entry.as_deref() else {
            return;
        };
        match stored {
            None => {
                if let Err(e) = self
                    .inner
                    .store
                    .set_entry(id, Some(found.to_string()))
                    .await
                {
                    tracing::warn!(tid = %id, op = "start", error = %format_error_chain(&e), "failed to persist entry");
                }
            }
            Some(s) if s != found => {
                tracing::info!(tid = %id, op = "start", stored = s, resolved = found, "resolved entry differs from stored entry");
            }
            Some(_) => {}
        }
    }

    /// Signal the group, clear the registry entry, and leave escalation to a
    /// background task. Returns whether an entry existed.
    ///
    /// The group is signalled even when the leader has already exited, since
    /// its children may still be running. A vanished group counts as success.
    async fn terminate(&self, id: &TargetId, reason: &str) -> bool {
        let Some(mut entry) = self.inner.registry.remove(id).await else {
            return false;
        };

        if entry.handle.is_alive() {
            append_marker(&entry.log_path, &format!("[scripthost] stop requested ({reason})")).await;
        }
        if let Err(e) = entry.handle.signal_group(GroupSignal::Terminate) {
            tracing::warn!(tid = %id, op = "stop", error = %e, "failed to signal process group");
        }

        let grace = self.inner.cfg.stop_grace;
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let leader_alive = entry.handle.is_alive();
            if let Err(e) = entry.handle.signal_group(GroupSignal::Kill) {
                tracing::warn!(tid = %id, op = "stop", error = %e, "failed to kill process group");
            }
            if leader_alive {
                tracing::warn!(tid = %id, op = "stop", "still alive after grace period; sent SIGKILL");
                append_marker(&entry.log_path, "[scripthost] stop: sent SIGKILL (timeout)").await;
            }
        });
        true
    }

    /// Stop `id` and clear its desired-running flag. Idempotent.
    pub async fn stop(&self, id: &TargetId) -> anyhow::Result<()> {
        let lock = self.op_lock(id).await;
        let _guard = lock.lock().await;

        if self.terminate(id, "stop").await {
            tracing::info!(tid = %id, op = "stop", "target stopped");
        }
        self.inner
            .store
            .set_desired_running(id, false)
            .await
            .context("persist desired-running")
    }

    /// Stop every registered target, clearing desired-running for each.
    pub async fn stop_all(&self) -> usize {
        let ids = self.inner.registry.ids().await;
        let mut stopped = 0;
        for id in ids {
            match self.stop(&id).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    tracing::warn!(tid = %id, op = "stop", error = %format_error_chain(&e), "stop failed");
                }
            }
        }
        stopped
    }

    /// Terminate every registered target without touching desired-running,
    /// so the next boot brings them back.
    pub async fn shutdown(&self) {
        for id in self.inner.registry.ids().await {
            let lock = self.op_lock(&id).await;
            let _guard = lock.lock().await;
            self.terminate(&id, "host shutdown").await;
        }
    }

    /// Start every target whose desired-running flag is set. One target's
    /// failure never blocks the others.
    pub async fn auto_start_desired(&self) -> AutoStartReport {
        let mut report = AutoStartReport::default();
        for (id, _) in self.inner.store.desired_running().await {
            match self.start(&id).await {
                Ok(StartOutcome::Started { .. }) => report.started.push(id),
                Ok(StartOutcome::NoRunnableEntry) => report.skipped.push(id),
                Err(e) => {
                    let msg = format_error_chain(&e);
                    tracing::warn!(tid = %id, op = "auto_start", error = %msg, "auto-start failed");
                    report.failed.push((id, msg));
                }
            }
        }
        tracing::info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "auto-start finished"
        );
        report
    }

    /// Truncate the target's log. Failures are logged and swallowed.
    pub async fn clear_log(&self, id: &TargetId) {
        let path = self.log_path(id);
        let res = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await;
        if let Err(e) = res {
            tracing::warn!(tid = %id, op = "clear_log", path = %path.display(), error = %e, "failed to clear log");
        }
    }

    /// Last `requested` lines of the target's log, clamped to
    /// `TAIL_MIN_LINES..=TAIL_MAX_LINES`.
    pub async fn tail_log(&self, id: &TargetId, requested: usize) -> String {
        let lines = requested.clamp(TAIL_MIN_LINES, TAIL_MAX_LINES);
        let path = self.log_path(id);
        match tail_file(&path, lines).await {
            Ok(Some(text)) if text.is_empty() => EMPTY_LOG.to_string(),
            Ok(Some(text)) => text,
            Ok(None) => NO_LOGS.to_string(),
            Err(e) => {
                tracing::warn!(tid = %id, op = "tail_log", error = %format_error_chain(&e), "failed to read log");
                NO_LOGS.to_string()
            }
        }
    }
}

impl Lifecycle for ProcessManager {
    fn restart_if_desired(
        &self,
        id: &TargetId,
    ) -> impl Future<Output = anyhow::Result<Option<StartOutcome>>> + Send {
        ProcessManager::restart_if_desired(self, id)
    }
}

async fn open_log(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))
}

async fn append_marker(path: &Path, line: &str) {
    let res = async {
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await?;
        f.write_all(format!("{line}\n").as_bytes()).await?;
        f.flush().await
    }
    .await;
    if let Err(e) = res {
        tracing::debug!(path = %path.display(), error = %e, "failed to write log marker");
    }
}

fn rotated_path(path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), n))
}

/// Shift `log.(n-1)` to `log.n` and the live file to `log.1` when it has
/// grown past the limit. Best effort.
async fn rotate_if_oversized(path: &Path, limits: LogLimits) {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if limits.max_bytes == 0 || size <= limits.max_bytes {
        return;
    }

    for i in (1..limits.max_files).rev() {
        let from = rotated_path(path, i);
        if tokio::fs::metadata(&from).await.is_ok() {
            let _ = tokio::fs::rename(&from, rotated_path(path, i + 1)).await;
        }
    }
    if let Err(e) = tokio::fs::rename(path, rotated_path(path, 1)).await {
        tracing::warn!(path = %path.display(), error = %e, "log rotation failed");
    }
}

/// Read at most `TAIL_WINDOW_BYTES` from the end of `path` and keep the last
/// `max_lines` lines. `None` if the file does not exist.
async fn tail_file(path: &Path, max_lines: usize) -> anyhow::Result<Option<String>> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let size = f.metadata().await?.len();
    let start = size.saturating_sub(TAIL_WINDOW_BYTES);
    f.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf).await?;

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    // A window that starts mid-file almost certainly starts mid-line.
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    if lines.len() > max_lines {
        lines.drain(0..(lines.len() - max_lines));
    }
    Ok(Some(lines.join("\n")))
}

//! Periodic sweep that restarts crashed targets and raises rate-limited
//! alerts.
//!
//! Restart attempts are not rate limited; only notifications are. Crash and
//! resource alerts keep separate cooldowns per target.

use std::time::Duration;

use scripthost_process::TargetId;
use tokio::{task::JoinHandle, time::Instant};

use crate::config::WatchdogConfig;
use crate::notify::{Notifier, alert_recipients};
use crate::ownership::OwnershipStore;
use crate::process_manager::{Lifecycle, StartOutcome};
use crate::process_manager_support::format_error_chain;
use crate::registry::{AlertKind, ProcessRegistry, ResourceSample};

const SAMPLE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub watched: usize,
    pub restart_attempts: usize,
    pub restart_failures: usize,
    pub alerts: usize,
    pub sample_errors: usize,
}

pub struct Watchdog<L, N> {
    lifecycle: L,
    store: OwnershipStore,
    registry: ProcessRegistry,
    notifier: N,
    cfg: WatchdogConfig,
    admin_id: i64,
}

impl<L: Lifecycle, N: Notifier> Watchdog<L, N> {
    pub fn new(
        lifecycle: L,
        store: OwnershipStore,
        registry: ProcessRegistry,
        notifier: N,
        cfg: WatchdogConfig,
        admin_id: i64,
    ) -> Self {
        Self {
            lifecycle,
            store,
            registry,
            notifier,
            cfg,
            admin_id,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.cfg.first_delay).await;
            loop {
                let report = self.tick().await;
                if report.restart_attempts > 0 || report.alerts > 0 {
                    tracing::info!(
                        watched = report.watched,
                        restarts = report.restart_attempts,
                        alerts = report.alerts,
                        "watchdog tick"
                    );
                }
                tokio::time::sleep(self.cfg.interval).await;
            }
        })
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let watch_list = self.store.desired_running().await;
        report.watched = watch_list.len();

        for (id, rec) in watch_list {
            if !self.registry.is_alive(&id).await {
                let text = format!("⚠️ {id} is down. Restarting...");
                if self.alert(&id, AlertKind::Down, rec.owner, &text).await {
                    report.alerts += 1;
                }
                report.restart_attempts += 1;
                match self.lifecycle.restart_if_desired(&id).await {
                    Ok(Some(StartOutcome::Started { .. })) => {}
                    // Stopped by its owner since the watch-list was read.
                    Ok(None) => {}
                    Ok(Some(StartOutcome::NoRunnableEntry)) => report.restart_failures += 1,
                    Err(e) => {
                        report.restart_failures += 1;
                        tracing::warn!(tid = %id, op = "watchdog", error = %format_error_chain(&e), "restart failed");
                    }
                }
                continue;
            }

            let sample = match tokio::time::timeout(SAMPLE_TIMEOUT, self.registry.sample(&id)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    report.sample_errors += 1;
                    tracing::debug!(tid = %id, op = "sample", error = %format_error_chain(&e), "resource sample skipped");
                    continue;
                }
                Err(_) => {
                    report.sample_errors += 1;
                    tracing::warn!(tid = %id, op = "sample", "resource sample timed out");
                    continue;
                }
            };

            if self.breaches(&sample) {
                let text = format!(
                    "🔥 High usage on {id}\nCPU: {:.1}%\nRAM: {:.1} MB",
                    sample.cpu_percent,
                    sample.rss_mb()
                );
                if self.alert(&id, AlertKind::Resource, rec.owner, &text).await {
                    report.alerts += 1;
                }
            }
        }
        report
    }

    fn breaches(&self, s: &ResourceSample) -> bool {
        s.cpu_percent >= self.cfg.cpu_alert_percent || s.rss_mb() >= self.cfg.ram_alert_mb
    }

    /// Notify admin and owner if the `kind` cooldown for `id` has elapsed.
    /// Returns whether an alert went out.
    async fn alert(&self, id: &TargetId, kind: AlertKind, owner: i64, text: &str) -> bool {
        let now = Instant::now();
        if !self
            .registry
            .alert_due(id, kind, self.cfg.alert_cooldown, now)
            .await
        {
            return false;
        }
        self.registry.mark_alerted(id, kind, now).await;

        for recipient in alert_recipients(self.admin_id, Some(owner)) {
            match tokio::time::timeout(self.cfg.notify_timeout, self.notifier.notify(recipient, text))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(tid = %id, op = "notify", recipient, error = %format_error_chain(&e), "alert delivery failed");
                }
                Err(_) => {
                    tracing::warn!(tid = %id, op = "notify", recipient, "alert delivery timed out");
                }
            }
        }
        true
    }
}

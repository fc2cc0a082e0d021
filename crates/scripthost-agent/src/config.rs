use std::{path::PathBuf, time::Duration};

use crate::process_manager_support::{
    duration_secs, env_f64, env_flag, env_i64, env_string, env_u64, env_usize,
};

const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

/// Per-target log rotation limits.
#[derive(Debug, Clone, Copy)]
pub struct LogLimits {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub first_delay: Duration,
    pub alert_cooldown: Duration,
    pub cpu_alert_percent: f64,
    pub ram_alert_mb: f64,
    pub notify_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(20),
            first_delay: Duration::from_secs(10),
            alert_cooldown: Duration::from_secs(180),
            cpu_alert_percent: 85.0,
            ram_alert_mb: 350.0,
            notify_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root for target work dirs and per-target log files.
    pub data_root: PathBuf,
    /// Directory holding `ownership.json` and `allowed_users.json`.
    pub state_dir: PathBuf,
    pub admin_id: i64,
    pub http_port: u16,
    pub public_url: String,
    pub bot_token: Option<String>,
    pub python: String,
    pub stop_grace: Duration,
    pub log_limits: LogLimits,
    pub host_log_dir: Option<PathBuf>,
    pub watchdog: WatchdogConfig,
}

impl HostConfig {
    /// Config rooted at `dir` with defaults for everything else. Used by tests
    /// and embedders that do not read the environment.
    pub fn with_root(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            data_root: dir.join("scripts"),
            state_dir: dir,
            admin_id: 0,
            http_port: 8080,
            public_url: "http://localhost:8080".to_string(),
            bot_token: None,
            python: "python3".to_string(),
            stop_grace: Duration::from_secs(5),
            log_limits: LogLimits::default(),
            host_log_dir: None,
            watchdog: WatchdogConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        let defaults = WatchdogConfig::default();
        let watchdog = WatchdogConfig {
            enabled: env_flag("SCRIPTHOST_ENABLE_ALERTS").unwrap_or(true),
            interval: duration_secs("SCRIPTHOST_HEALTHCHECK_INTERVAL_SEC", 20, 1, 3600),
            first_delay: duration_secs("SCRIPTHOST_WATCHDOG_FIRST_DELAY_SEC", 10, 0, 600),
            alert_cooldown: duration_secs("SCRIPTHOST_ALERT_COOLDOWN_SEC", 180, 0, 24 * 3600),
            cpu_alert_percent: env_f64("SCRIPTHOST_CPU_ALERT_PERCENT")
                .map(|v| v.clamp(1.0, 100_000.0))
                .unwrap_or(defaults.cpu_alert_percent),
            ram_alert_mb: env_f64("SCRIPTHOST_RAM_ALERT_MB")
                .map(|v| v.clamp(1.0, 1024.0 * 1024.0))
                .unwrap_or(defaults.ram_alert_mb),
            notify_timeout: duration_secs("SCRIPTHOST_NOTIFY_TIMEOUT_SEC", 10, 1, 120),
        };

        let http_port = env_u64("SCRIPTHOST_HTTP_PORT")
            .or_else(|| env_u64("PORT"))
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(8080);

        let log_limits = LogLimits {
            max_bytes: env_u64("SCRIPTHOST_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(64 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
            max_files: env_usize("SCRIPTHOST_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
        };

        Self {
            data_root: env_string("SCRIPTHOST_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scripts")),
            state_dir: env_string("SCRIPTHOST_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            admin_id: env_i64("SCRIPTHOST_ADMIN_ID").unwrap_or(0),
            http_port,
            public_url: env_string("SCRIPTHOST_PUBLIC_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("http://localhost:{http_port}")),
            bot_token: env_string("SCRIPTHOST_BOT_TOKEN"),
            python: env_string("SCRIPTHOST_PYTHON").unwrap_or_else(|| "python3".to_string()),
            stop_grace: duration_secs("SCRIPTHOST_STOP_GRACE_SEC", 5, 1, 60),
            log_limits,
            host_log_dir: env_string("SCRIPTHOST_LOG_DIR").map(PathBuf::from),
            watchdog,
        }
    }

    pub fn ownership_file(&self) -> PathBuf {
        self.state_dir.join("ownership.json")
    }

    pub fn allowlist_file(&self) -> PathBuf {
        self.state_dir.join("allowed_users.json")
    }
}

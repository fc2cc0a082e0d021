use std::net::SocketAddr;

use anyhow::Context;
use scripthost_agent::{HostConfig, HostService, http, notify::AnyNotifier, watchdog::Watchdog};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console logging plus an optional daily-rolling file. The returned guard
/// must live as long as the process so buffered lines are flushed.
fn init_tracing(cfg: &HostConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &cfg.host_log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "scripthost-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = HostConfig::from_env();
    let _log_guard = init_tracing(&cfg);

    if cfg.admin_id == 0 {
        tracing::warn!("SCRIPTHOST_ADMIN_ID is not set; administrator operations are disabled");
    }

    let svc = HostService::open(cfg).await?;
    let cfg = svc.config().clone();
    tracing::info!(data_root = %cfg.data_root.display(), state_dir = %cfg.state_dir.display(), "scripthost-agent starting");

    svc.restore().await;

    let watchdog = if cfg.watchdog.enabled {
        let notifier = AnyNotifier::from_config(cfg.bot_token.as_deref(), cfg.watchdog.notify_timeout);
        let manager = svc.manager().clone();
        let handle = Watchdog::new(
            manager.clone(),
            svc.store().clone(),
            manager.registry().clone(),
            notifier,
            cfg.watchdog.clone(),
            cfg.admin_id,
        )
        .spawn();
        Some(handle)
    } else {
        tracing::info!("watchdog disabled");
        None
    };

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "scripthost-agent HTTP listening");

    axum::serve(listener, http::router(svc.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    if let Some(handle) = watchdog {
        handle.abort();
    }
    svc.shutdown().await;
    Ok(())
}

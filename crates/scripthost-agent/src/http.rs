use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use scripthost_process::TargetId;
use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::service::HostService;

const DEFAULT_TAIL_LINES: usize = 250;

pub fn router(svc: HostService) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/api/logs", get(logs))
        .with_state(svc)
}

async fn home() -> &'static str {
    "🤖 Script host is alive!"
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    targets: usize,
    running: usize,
}

async fn healthz(State(svc): State<HostService>) -> Json<HealthzResponse> {
    let stats = svc.stats().await;
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        targets: stats.total,
        running: stats.running,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    script: String,
    #[serde(default)]
    key: String,
}

async fn status(State(svc): State<HostService>, Query(q): Query<StatusQuery>) -> Response {
    if q.script.is_empty() {
        return (StatusCode::BAD_REQUEST, "Specify script").into_response();
    }
    let id = TargetId::new(q.script);
    match svc.status(&id, &q.key).await {
        Ok(st) if st.running() => (StatusCode::OK, format!("✅ {id} is running.")).into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, format!("❌ {id} is stopped.")).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    id: String,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    lines: Option<String>,
}

async fn logs(State(svc): State<HostService>, Query(q): Query<LogsQuery>) -> Response {
    let Some(uid) = q
        .uid
        .as_deref()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|uid| *uid != 0)
    else {
        return access_denied();
    };
    // An unparsable count falls back like an absent one.
    let lines = q
        .lines
        .as_deref()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_TAIL_LINES);

    let id = TargetId::new(q.id);
    match svc.tail_log(&id, uid, lines).await {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(HostError::Forbidden) => access_denied(),
        Err(e) => e.into_response(),
    }
}

fn access_denied() -> Response {
    (StatusCode::FORBIDDEN, "⛔ Access Denied").into_response()
}

#[cfg(test)]
mod tests {
    use scripthost_process::TargetKind;

    use super::*;
    use crate::config::HostConfig;

    async fn service(dir: &tempfile::TempDir) -> HostService {
        let mut cfg = HostConfig::with_root(dir.path());
        cfg.admin_id = 1;
        cfg.python = "sh".to_string();
        HostService::open(cfg).await.unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn status_query(script: &str, key: &str) -> Query<StatusQuery> {
        Query(StatusQuery {
            script: script.to_string(),
            key: key.to_string(),
        })
    }

    #[tokio::test]
    async fn status_requires_script() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let resp = status(State(svc), Query(StatusQuery::default())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(resp).await, "Specify script");
    }

    #[tokio::test]
    async fn status_hides_unknown_and_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();

        let wrong = status(State(svc.clone()), status_query(id.as_str(), "nope")).await;
        let unknown = status(State(svc), status_query("u1|ghost.py", "nope")).await;
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
        assert_eq!(unknown.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(wrong).await, body_text(unknown).await);
    }

    #[tokio::test]
    async fn stopped_target_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, key) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();
        let resp = status(State(svc), status_query(id.as_str(), key.as_str())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("is stopped"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_target_is_200() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let work = svc.config().data_root.join("42");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("job.py"), "exec sleep 30\n").unwrap();
        let (id, key) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();
        assert!(svc.restart(&id, 42).await.unwrap().is_started());

        let resp = status(State(svc.clone()), status_query(id.as_str(), key.as_str())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        svc.stop(&id, 42).await.unwrap();
    }

    #[tokio::test]
    async fn logs_are_owner_gated() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();

        let denied = logs(
            State(svc.clone()),
            Query(LogsQuery {
                id: id.to_string(),
                uid: Some("7".to_string()),
                lines: None,
            }),
        )
        .await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let garbage_uid = logs(
            State(svc.clone()),
            Query(LogsQuery {
                id: id.to_string(),
                uid: Some("abc".to_string()),
                lines: None,
            }),
        )
        .await;
        assert_eq!(garbage_uid.status(), StatusCode::FORBIDDEN);

        let ok = logs(
            State(svc),
            Query(LogsQuery {
                id: id.to_string(),
                uid: Some("42".to_string()),
                lines: Some("10".to_string()),
            }),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_text(ok).await, crate::process_manager::NO_LOGS);
    }

    #[tokio::test]
    async fn logs_without_uid_are_denied_when_admin_unset() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = HostConfig::with_root(dir.path());
        cfg.admin_id = 0;
        let svc = HostService::open(cfg).await.unwrap();
        let (id, _) = svc
            .create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();

        for uid in [None, Some("0"), Some("")] {
            let resp = logs(
                State(svc.clone()),
                Query(LogsQuery {
                    id: id.to_string(),
                    uid: uid.map(str::to_string),
                    lines: None,
                }),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "uid {uid:?}");
            assert_eq!(body_text(resp).await, "⛔ Access Denied");
        }
    }

    #[tokio::test]
    async fn healthz_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_target(TargetKind::UserFile, 42, "job.py")
            .await
            .unwrap();
        let Json(h) = healthz(State(svc)).await;
        assert_eq!(h.status, "ok");
        assert_eq!(h.targets, 1);
        assert_eq!(h.running, 0);
    }
}

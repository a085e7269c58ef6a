//! Liveness and readiness probes.
//!
//! - GET /healthz -> process is up, no I/O
//! - GET /readyz  -> SQLite answers and both working directories accept a
//!   write/read/delete round trip; also reports in-flight sessions

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

const PROBE_BYTES: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Always 200. Must stay free of I/O so it answers even when disks stall.
pub async fn healthz() -> impl IntoResponse {
    Json(Liveness { status: "ok" })
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert(
        "sqlite",
        match service.ledger.ping().await {
            Ok(()) => CheckStatus::ok(),
            Err(e) => CheckStatus::failed(format!("ping failed: {}", e)),
        },
    );
    checks.insert("staging_dir", dir_round_trip(service.store.root()).await);
    checks.insert("upload_dir", dir_round_trip(service.finalizer.output_dir()).await);

    let ready = checks.values().all(|c| c.ok);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Readiness {
        status: if ready { "ok" } else { "error" },
        active_sessions: service.tracker.active_sessions().await,
        checks,
    };
    (code, Json(body))
}

async fn dir_round_trip(dir: &Path) -> CheckStatus {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, PROBE_BYTES).await {
        return CheckStatus::failed(format!("write {}: {}", probe.display(), e));
    }
    let status = match fs::read(&probe).await {
        Ok(bytes) if bytes == PROBE_BYTES => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("probe content mismatch".to_string()),
        Err(e) => CheckStatus::failed(format!("read {}: {}", probe.display(), e)),
    };
    // A leftover probe file is worth reporting but does not fail readiness.
    match fs::remove_file(&probe).await {
        Err(e) if status.ok => CheckStatus {
            ok: true,
            error: Some(format!("remove {}: {}", probe.display(), e)),
        },
        _ => status,
    }
}

#[derive(Serialize)]
struct Liveness {
    status: &'static str,
}

#[derive(Serialize)]
struct Readiness {
    status: &'static str,
    active_sessions: usize,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

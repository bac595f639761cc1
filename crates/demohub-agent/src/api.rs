use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use demohub_process::{
    BundleManifest, CleanupResponse, EnvironmentStatusResponse, LaunchResponse, LogsResponse,
    PrepareResponse, RunningDemo, StatusResponse, StopAllResponse, StopResponse, TenantId,
};

use crate::{error::DemoError, error_payload::ErrorPayload, orchestrator::DemoOrchestrator};

const DEFAULT_LOG_LINES: usize = 200;
const MAX_LOG_LINES: usize = 2000;

pub type AppState = Arc<DemoOrchestrator>;

#[derive(Debug)]
pub struct ApiError(DemoError);

impl From<DemoError> for ApiError {
    fn from(value: DemoError) -> Self {
        Self(value)
    }
}

pub(crate) fn status_for(err: &DemoError) -> StatusCode {
    match err {
        DemoError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DemoError::ProvisionFailed { .. } => StatusCode::BAD_GATEWAY,
        DemoError::EntryNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DemoError::UnknownTenant(_) => StatusCode::NOT_FOUND,
        DemoError::InvalidTenant(_) => StatusCode::BAD_REQUEST,
        DemoError::SpawnFailed { .. } | DemoError::StopFailed { .. } | DemoError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(ErrorPayload::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn tenant(raw: &str) -> Result<TenantId, ApiError> {
    TenantId::parse(raw).map_err(|e| ApiError(DemoError::from(e)))
}

#[derive(Debug, serde::Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    running_demos: usize,
    reserved_ports: usize,
    port_range: String,
}

async fn healthz(State(orch): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        running_demos: orch.list_running().len(),
        reserved_ports: orch.reserved_ports(),
        port_range: orch.config().port_range.to_string(),
    })
}

async fn register_manifest(
    State(orch): State<AppState>,
    Path(raw): Path<String>,
    Json(manifest): Json<BundleManifest>,
) -> Result<StatusCode, ApiError> {
    let t = tenant(&raw)?;
    orch.register_manifest(&t, manifest).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn launch(State(orch): State<AppState>, Path(raw): Path<String>) -> ApiResult<LaunchResponse> {
    let t = tenant(&raw)?;
    Ok(Json(orch.launch(&t).await?))
}

async fn status(State(orch): State<AppState>, Path(raw): Path<String>) -> ApiResult<StatusResponse> {
    let t = tenant(&raw)?;
    Ok(Json(orch.status(&t).await))
}

async fn stop(State(orch): State<AppState>, Path(raw): Path<String>) -> ApiResult<StopResponse> {
    let t = tenant(&raw)?;
    Ok(Json(orch.stop(&t).await?))
}

async fn cleanup(
    State(orch): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<CleanupResponse> {
    let t = tenant(&raw)?;
    Ok(Json(orch.cleanup(&t).await?))
}

async fn prepare(
    State(orch): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<PrepareResponse> {
    let t = tenant(&raw)?;
    Ok(Json(orch.prepare(&t).await?))
}

async fn environment(
    State(orch): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<EnvironmentStatusResponse> {
    let t = tenant(&raw)?;
    Ok(Json(orch.environment_status(&t).await))
}

#[derive(Debug, serde::Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(
    State(orch): State<AppState>,
    Path(raw): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<LogsResponse> {
    let t = tenant(&raw)?;
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);
    Ok(Json(orch.logs(&t, limit)))
}

async fn running(State(orch): State<AppState>) -> Json<Vec<RunningDemo>> {
    Json(orch.list_running())
}

async fn stop_all(State(orch): State<AppState>) -> Json<StopAllResponse> {
    Json(orch.stop_all().await)
}

pub fn router(orch: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/tenants/:tenant_id/manifest", put(register_manifest))
        .route("/api/demo/running", get(running))
        .route("/api/demo/stop-all", post(stop_all))
        .route("/api/demo/:tenant_id/launch", post(launch))
        .route("/api/demo/:tenant_id/status", get(status))
        .route("/api/demo/:tenant_id/stop", post(stop))
        .route("/api/demo/:tenant_id/cleanup", post(cleanup))
        .route("/api/demo/:tenant_id/prepare", post(prepare))
        .route("/api/demo/:tenant_id/environment", get(environment))
        .route("/api/demo/:tenant_id/logs", get(logs))
        .with_state(orch)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use demohub_process::{DemoState, LaunchState};

    use super::*;
    use crate::{
        config::{DemoConfig, PortRange},
        orchestrator::Collaborators,
        tenants::TenantStore,
        testing::{CountingStore, FakeInspector, ScriptRuntime, seed_bundle},
    };

    fn orchestrator(dir: &std::path::Path) -> (AppState, Arc<CountingStore>) {
        let data_root = dir.to_string_lossy().into_owned();
        let mut cfg = DemoConfig::from_lookup(|name| match name {
            "DEMOHUB_DATA_ROOT" => Some(data_root.clone()),
            "DEMOHUB_TENANTS_FILE" => Some("off".to_string()),
            "DEMOHUB_LAUNCH_GRACE_MS" => Some("300".to_string()),
            _ => None,
        })
        .unwrap();
        cfg.port_range = PortRange::new(9300, 9300).unwrap();
        let store = Arc::new(CountingStore::new(cfg.object_store_root.clone(), Duration::ZERO));
        let tenants = Arc::new(TenantStore::in_memory());
        let orch = Arc::new(DemoOrchestrator::new(
            Arc::new(cfg),
            Collaborators {
                store: store.clone(),
                runtime: Arc::new(ScriptRuntime::default()),
                inspector: Arc::new(FakeInspector::default()),
                manifests: tenants.clone(),
                metadata: tenants,
            },
        ));
        (orch, store)
    }

    #[test]
    fn error_status_codes() {
        let range = PortRange::new(9000, 9000).unwrap();
        assert_eq!(
            status_for(&DemoError::ResourceExhausted { range }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&DemoError::UnknownTenant(TenantId::parse("x").unwrap())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DemoError::EntryNotFound {
                entry: "app.py".into(),
                tried: vec![],
                present: vec![],
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&DemoError::Internal(anyhow::anyhow!("x"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn invalid_tenant_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(dir.path());
        let err = launch(State(orch), Path("..".to_string()))
            .await
            .unwrap_err();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handlers_drive_the_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, store) = orchestrator(dir.path());
        let t = TenantId::parse("t1").unwrap();
        seed_bundle(store.root(), &t, &[("app.py", "x")]);

        let code = register_manifest(
            State(orch.clone()),
            Path("t1".to_string()),
            Json(BundleManifest {
                entry_path: "app.py".into(),
                dependency_manifest_path: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(code, StatusCode::NO_CONTENT);

        let Json(resp) = launch(State(orch.clone()), Path("t1".to_string()))
            .await
            .unwrap();
        assert_eq!(resp.state, LaunchState::Launching);

        let Json(st) = status(State(orch.clone()), Path("t1".to_string()))
            .await
            .unwrap();
        assert_eq!(st.state, DemoState::Running);

        let Json(list) = running(State(orch.clone())).await;
        assert_eq!(list.len(), 1);

        let Json(all) = stop_all(State(orch.clone())).await;
        assert_eq!(all.demos_stopped, 1);
        assert!(all.ports_freed >= 1);
    }
}

//! HTTP control API used by the chat front end.
//!
//! Monitoring:
//!   POST /api/monitor/:user_id/start   → start (or restart) a window
//!   POST /api/monitor/:user_id/stop    → stop the user's window
//!   POST /api/monitor/refresh          → re-evaluate the watch set now
//!   GET  /api/monitor/active           → active windows
//!   GET  /api/status                   → connection state and watch set size
//!
//! Manual deposit flow:
//!   POST /api/deposits/:user_id/check     → balance check, schedules one recheck
//!   POST /api/deposits/:user_id/pending   → queue an investment
//!   POST /api/deposits/:user_id/complete  → deploy the queued amount
//!   POST /api/deposits/:user_id/partial   → deploy what is there now
//!   POST /api/deposits/:user_id/cancel    → drop the queued investment

use crate::manual::{ManualCheckError, ManualChecker, QueueRequest};
use crate::monitor::ControllerHandle;
use crate::store::{MonitorContext, WindowStore};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn WindowStore>,
    pub controller: ControllerHandle,
    pub checker: Arc<ManualChecker>,
    pub default_ttl_minutes: u32,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub context: MonitorContext,
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct PendingRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub protocol_hint: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub apy: Option<f64>,
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/monitor/active", get(api_active))
        .route("/api/monitor/refresh", post(api_refresh))
        .route("/api/monitor/:user_id/start", post(api_start))
        .route("/api/monitor/:user_id/stop", post(api_stop))
        .route("/api/deposits/:user_id/check", post(api_check))
        .route("/api/deposits/:user_id/pending", post(api_pending))
        .route("/api/deposits/:user_id/complete", post(api_complete))
        .route("/api/deposits/:user_id/partial", post(api_partial))
        .route("/api/deposits/:user_id/cancel", post(api_cancel))
        .with_state(state)
}

pub async fn serve(state: ApiState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "control API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn manual_error(e: ManualCheckError) -> Response {
    let status = match &e {
        ManualCheckError::UnknownUser(_) | ManualCheckError::NoPending(_) => StatusCode::NOT_FOUND,
        ManualCheckError::InsufficientBalance { .. }
        | ManualCheckError::NothingToInvest
        | ManualCheckError::NotActive(_) => StatusCode::CONFLICT,
        ManualCheckError::InvalidAmount => StatusCode::BAD_REQUEST,
        ManualCheckError::Balance(_) => StatusCode::BAD_GATEWAY,
        ManualCheckError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "manual deposit request failed");
    }
    error_body(status, e.to_string())
}

// --- Monitoring ---

async fn api_status(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.controller.snapshot();
    Json(json!({
        "state": state.controller.state(),
        "watched": snapshot.len(),
        "generated_at": snapshot.generated_at(),
    }))
}

async fn api_active(State(state): State<ApiState>) -> Response {
    match state.store.list_active(Utc::now()).await {
        Ok(windows) => Json(windows).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn api_refresh(State(state): State<ApiState>) -> impl IntoResponse {
    state.controller.force_refresh();
    (StatusCode::ACCEPTED, Json(json!({ "refreshing": true })))
}

async fn api_start(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<StartRequest>,
) -> Response {
    let ttl_minutes = req.ttl_minutes.unwrap_or(state.default_ttl_minutes);
    if ttl_minutes == 0 {
        return error_body(StatusCode::BAD_REQUEST, "ttl_minutes must be positive");
    }

    if let Err(e) = state
        .store
        .start(&user_id, req.context, ttl_minutes, req.metadata)
        .await
    {
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    state.controller.force_refresh();
    info!(
        user_id = %user_id,
        context = %req.context,
        ttl_minutes = ttl_minutes,
        "monitoring started"
    );

    Json(json!({
        "user_id": user_id,
        "context": req.context,
        "ttl_minutes": ttl_minutes,
    }))
    .into_response()
}

async fn api_stop(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    match state.store.stop(&user_id).await {
        Ok(stopped) => {
            state.controller.force_refresh();
            Json(json!({ "user_id": user_id, "stopped": stopped })).into_response()
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// --- Manual deposit flow ---

async fn api_check(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    match state.checker.check_and_schedule(&user_id).await {
        Ok(outcome) => Json(json!({
            "result": outcome,
            "message": outcome.message(),
        }))
        .into_response(),
        Err(e) => manual_error(e),
    }
}

async fn api_pending(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<PendingRequest>,
) -> Response {
    let request = QueueRequest {
        amount: req.amount,
        protocol_hint: req.protocol_hint,
        pool_id: req.pool_id,
        apy: req.apy,
        ttl_minutes: req.ttl_minutes,
    };
    match state.checker.queue_investment(&user_id, request).await {
        Ok(pending) => {
            let message = crate::notify::messages::queued(pending.amount, pending.shortage);
            Json(json!({ "pending": pending, "message": message })).into_response()
        }
        Err(e) => manual_error(e),
    }
}

async fn api_complete(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    match state.checker.complete(&user_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => manual_error(e),
    }
}

async fn api_partial(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    match state.checker.invest_partial(&user_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => manual_error(e),
    }
}

async fn api_cancel(State(state): State<ApiState>, Path(user_id): Path<String>) -> Response {
    match state.checker.cancel(&user_id).await {
        Ok(stopped) => Json(json!({ "user_id": user_id, "stopped": stopped })).into_response(),
        Err(e) => manual_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::{FakeAdapter, FixedYields};
    use crate::deploy::DeploymentPipeline;
    use crate::manual::tests::ScriptedBalances;
    use crate::manual::RecheckScheduler;
    use crate::monitor::tests::FakeLauncher;
    use crate::monitor::{ConnectionController, ControllerConfig, RefreshTrigger};
    use crate::notify::tests::RecordingNotifier;
    use crate::store::MemoryWindowStore;
    use crate::watch::tests::FakeDirectory;
    use crate::watch::WatchSetLoader;
    use alloy::primitives::Address;
    use std::time::Duration;

    fn state() -> (ApiState, Arc<MemoryWindowStore>) {
        let store = Arc::new(MemoryWindowStore::new());
        let loader = WatchSetLoader::new(Arc::new(FakeDirectory::default().with_user(
            "u1",
            Address::repeat_byte(0x01),
            None,
        )));
        let trigger = RefreshTrigger::new();
        let controller = ConnectionController::new(
            ControllerConfig {
                fast_period: Duration::from_secs(5),
                slow_period: Duration::from_secs(30),
                reconnect_backoff: Duration::from_secs(10),
            },
            store.clone(),
            loader.clone(),
            Arc::new(FakeLauncher::default()),
            trigger.clone(),
        );
        let pipeline = Arc::new(DeploymentPipeline::new(
            Arc::new(FixedYields(Ok(vec![]))),
            Arc::new(FakeAdapter::default()),
            Arc::new(RecordingNotifier::default()),
        ));
        let checker = Arc::new(ManualChecker::new(
            store.clone(),
            loader,
            Arc::new(ScriptedBalances::default()),
            pipeline,
            RecheckScheduler::new(Duration::from_secs(30)),
            trigger,
            30,
        ));
        let state = ApiState {
            store: store.clone(),
            controller: controller.handle(),
            checker,
            default_ttl_minutes: 30,
        };
        (state, store)
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (state, store) = state();
        let req = StartRequest {
            context: MonitorContext::Onboarding,
            ttl_minutes: Some(5),
            metadata: Map::new(),
        };

        let resp = api_start(State(state.clone()), Path("u1".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.list_active(Utc::now()).await.unwrap().len(), 1);

        let resp = api_stop(State(state), Path("u1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(store.list_active(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_zero_ttl() {
        let (state, store) = state();
        let req = StartRequest {
            context: MonitorContext::BalanceCheck,
            ttl_minutes: Some(0),
            metadata: Map::new(),
        };
        let resp = api_start(State(state), Path("u1".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_without_pending_is_not_found() {
        let (state, _store) = state();
        let resp = api_complete(State(state), Path("u1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pending_rejects_non_positive_amount() {
        let (state, _store) = state();
        let req = PendingRequest {
            amount: Decimal::ZERO,
            protocol_hint: None,
            pool_id: None,
            apy: None,
            ttl_minutes: None,
        };
        let resp = api_pending(State(state), Path("u1".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_start_request_defaults() {
        let req: StartRequest = serde_json::from_str(r#"{"context":"pending_investment"}"#).unwrap();
        assert_eq!(req.context, MonitorContext::PendingInvestment);
        assert!(req.ttl_minutes.is_none());
        assert!(req.metadata.is_empty());
    }
}

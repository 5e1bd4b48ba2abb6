//! API handlers.
//!
//! Reads go through the `watch` snapshot or the store; the registration
//! callback is the only write and uses the store's compare-and-set like
//! every other transition.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use forgepool_state::InstanceState;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Pool ───────────────────────────────────────────────────────────

/// GET /api/v1/pool
pub async fn pool_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    ApiResponse::ok(status)
}

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_all() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Registration callback ──────────────────────────────────────────

/// Registration callback body.
#[derive(serde::Deserialize)]
pub struct RegisterRequest {
    pub agent_token: String,
}

#[derive(serde::Serialize)]
pub struct RegisterResponse {
    pub instance_id: String,
}

/// POST /api/v1/register
///
/// The coordinator reports that an agent holding `agent_token` has
/// registered; the matching instance becomes Active.
pub async fn register_agent(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let instance = match state.store.find_by_token(&req.agent_token) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            return error_response("unknown agent token", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };

    match state.store.transition(
        &instance.id,
        &[InstanceState::Provisioning, InstanceState::Registering],
        InstanceState::Active,
        epoch_secs(),
        3,
    ) {
        Ok(Some(updated)) => {
            tracing::info!(id = %updated.id, "agent registered via callback");
            ApiResponse::ok(RegisterResponse {
                instance_id: updated.id,
            })
            .into_response()
        }
        Ok(None) => error_response(
            "instance is not awaiting registration",
            StatusCode::CONFLICT,
        )
        .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Health / metrics ───────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    let body = crate::prometheus::render_prometheus(&status);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

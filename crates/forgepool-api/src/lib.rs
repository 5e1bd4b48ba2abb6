//! forgepool-api — operational surface for Forgepool.
//!
//! Read-only observability plus the one inbound write the pool accepts:
//! the coordinator's agent-registration callback.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pool` | Pool snapshot: sizes, demand, per-state counts |
//! | GET | `/api/v1/instances` | Per-instance records |
//! | POST | `/api/v1/register` | Agent registration callback (by token) |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::watch;

use forgepool_scaler::PoolStatus;
use forgepool_state::InstanceStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: InstanceStore,
    /// Live pool snapshot published by the reconcile loop.
    pub status: watch::Receiver<PoolStatus>,
}

/// Build the complete API router.
pub fn build_router(store: InstanceStore, status: watch::Receiver<PoolStatus>) -> Router {
    let state = ApiState { store, status };

    let api_routes = Router::new()
        .route("/pool", get(handlers::pool_status))
        .route("/instances", get(handlers::list_instances))
        .route("/register", post(handlers::register_agent))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}

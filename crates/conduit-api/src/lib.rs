//! # conduit-api
//!
//! Admin and observer HTTP surface for the conduit ingestion pipeline: job
//! status documents, completeness checks, resets, worker pool control and a
//! Server-Sent Events notification stream.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use conduit_jobs::Pipeline;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

pub fn router(state: AppState) -> Router {
    use handlers::{events, jobs, pools};

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/api/v1/jobs/:id", get(jobs::get_job))
        .route("/api/v1/jobs/:id/status", get(jobs::get_job_status))
        .route("/api/v1/jobs/:id/run", post(jobs::run_job))
        .route("/api/v1/jobs/:id/completion", get(jobs::check_completion))
        .route("/api/v1/jobs/:id/reset", post(jobs::reset_job))
        .route("/api/v1/pools", get(pools::list_pools))
        .route("/api/v1/pools/:tier/:stage/:action", post(pools::pool_action))
        .route("/api/v1/queues", get(pools::list_queues))
        .route("/api/v1/events", get(events::sse_events))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

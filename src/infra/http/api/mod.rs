pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;

pub use state::ApiState;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::infra::http::RouterState;
use crate::infra::http::middleware::{log_responses, set_request_context};

pub fn build_api_router(state: RouterState) -> Router {
    let auth_state = state.api.clone();
    let admission_state = state.api.clone();

    Router::new()
        .route("/api/v1/pdf", post(handlers::submit_pdf))
        .route("/api/v1/pdf/jobs/{id}", get(handlers::job_status))
        .route("/api/v1/pdf/jobs/{id}/result", get(handlers::job_result))
        .route("/api/v1/pdf/stats", get(handlers::caller_stats))
        .route("/api/v1/keys/current", get(handlers::caller_stats))
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(
            admission_state,
            middleware::api_admission,
        ))
        .layer(axum_middleware::from_fn_with_state(
            auth_state,
            middleware::api_auth,
        ))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

pub mod api;
mod middleware;
mod public;

pub use api::{ApiState, build_api_router};
pub use middleware::CallerLabel;
pub use public::{HttpState, build_router};

use axum::Router;
use axum::extract::FromRef;

#[derive(Clone)]
pub struct RouterState {
    pub http: HttpState,
    pub api: ApiState,
}

impl FromRef<RouterState> for HttpState {
    fn from_ref(state: &RouterState) -> Self {
        state.http.clone()
    }
}

impl FromRef<RouterState> for ApiState {
    fn from_ref(state: &RouterState) -> Self {
        state.api.clone()
    }
}

/// Public and API routes on one router.
pub fn build_app(state: RouterState) -> Router {
    build_router(state.clone()).merge(build_api_router(state))
}

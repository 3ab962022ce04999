pub mod health;
pub mod jobs;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the operational router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(jobs::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

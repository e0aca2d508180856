//! HTTP surface: health probes and the internal reconciler endpoints.

mod error;
mod health;
mod internal;

pub use error::{ApiError, ProblemDetails};

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/internal", internal::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

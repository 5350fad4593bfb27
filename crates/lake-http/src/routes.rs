//! Route table

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;

use crate::auth::{request_id_middleware, require_token};
use crate::handlers;
use crate::state::AppState;

/// Build the agent router.
///
/// Every route requires the agent token. The `/queries` routes are only
/// mounted when the query lifecycle is enabled; without them callers get a
/// plain 404 and fall back to `/execute`.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/execute", post(handlers::execute))
        .route("/metrics", get(handlers::metrics));

    if state.lifecycle_enabled {
        router = router
            .route("/queries", post(handlers::submit_query))
            .route(
                "/queries/:id",
                get(handlers::get_query).delete(handlers::delete_query),
            )
            .route("/queries/:id/results", get(handlers::fetch_results))
            .route("/queries/:id/cancel", post(handlers::cancel_query));
    }

    router
        .route_layer(from_fn_with_state(state.clone(), require_token))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

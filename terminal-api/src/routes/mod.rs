//! API route definitions

mod entities;
mod health;

use axum::Router;
use crate::AppState;

/// Create all API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(entities::routes())
        .merge(health::routes())
}

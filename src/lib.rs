pub mod api;
pub mod config;
pub mod conversation;
pub mod inference;

use std::path::Path;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};

pub use api::AppState;
pub use config::AppConfig;

pub fn build_app(state: AppState, static_dir: &Path) -> Router {
    api::router()
        .nest_service("/static", ServeDir::new(static_dir))
        // CORS for JSON clients
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

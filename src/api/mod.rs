use std::sync::Arc;

use axum::{routing::get, Router};

use crate::inference::EngineSlot;

pub mod error;
pub mod handlers;
pub mod page;
pub mod types;

pub use error::ChatError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EngineSlot>,
}

impl AppState {
    pub fn new(engine: EngineSlot) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

/// Chat page and JSON API, both on `/`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::index).post(handlers::submit))
        .fallback(handlers::not_found)
}

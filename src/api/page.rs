use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use minijinja::Environment;
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::error;

use crate::inference::EngineSlot;

const INDEX_TEMPLATE: &str = "index.html";

static PAGES: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.add_template(
        INDEX_TEMPLATE,
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/index.html")),
    )
    .unwrap_or_else(|err| panic!("embedded index template does not compile: {err}"));
    env
});

#[derive(Debug, Default, Serialize)]
pub struct PageContext {
    pub model_loaded: bool,
    /// Startup load failure, shown while the model is unavailable.
    pub error_message: Option<String>,
    pub user_message: Option<String>,
    pub bot_response: Option<String>,
    /// Failure of the current form submission.
    pub error: Option<String>,
}

impl PageContext {
    pub fn status(engine: &EngineSlot) -> Self {
        Self {
            model_loaded: engine.is_loaded(),
            error_message: engine.load_error().map(str::to_string),
            ..Default::default()
        }
    }
}

pub fn render_page(ctx: &PageContext) -> Response {
    let rendered = PAGES
        .get_template(INDEX_TEMPLATE)
        .and_then(|tpl| tpl.render(ctx));

    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            error!(error = %err, "index page rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "page rendering failed").into_response()
        }
    }
}

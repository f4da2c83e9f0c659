use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatbot_web::{build_app, inference::load_engine, AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatbot_web=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    info!(?config, "starting chatbot");

    // -----------------------------
    // Model (loaded once, never reloaded)
    // -----------------------------
    let engine = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || load_engine(&config))
            .await
            .context("model loading task panicked")?
    };
    if !engine.is_loaded() {
        warn!("serving without a model; restart once the model is in place");
    }

    let app = build_app(AppState::new(engine), &config.static_dir);

    let listener = TcpListener::bind(config.bind_addr.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("🌐 HTTP listening on http://{}", config.bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

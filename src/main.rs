mod classifier;
mod config;
mod error;
mod fetcher;
mod metrics;
mod model_config;
mod moderation;
mod nsfw_model;
mod policy;
mod routes;
mod validator;

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{SERVICE_NAME, SERVICE_VERSION, ServiceConfig};
use crate::error::ModerationError;
use crate::metrics::MetricsRecorder;
use crate::moderation::Moderator;
use crate::nsfw_model::NsfwModel;
use crate::routes::AppState;

fn init_tracing() {
    // RUST_LOG wins; LOG_LEVEL is the simpler knob.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::from_env()?;
    init_tracing();

    tracing::info!(version = SERVICE_VERSION, "starting {SERVICE_NAME}");

    // Without a model there is nothing to serve.
    let model_dir = config.model_dir.clone();
    let model = tokio::task::spawn_blocking(move || NsfwModel::new(&model_dir))
        .await?
        .map_err(|e| {
            tracing::error!(error = %e, model_dir = ?config.model_dir, "failed to load model");
            ModerationError::ClassifierUnavailable(e.to_string())
        })?;
    tracing::info!(model = %config.model_name, "model loaded");

    let metrics = Arc::new(MetricsRecorder::new());
    let moderator = Moderator::new(&config, Arc::new(model), metrics)?;

    let bind_addr = config.bind_addr;
    let app = routes::router(AppState {
        moderator: Arc::new(moderator),
        config: Arc::new(config),
    });

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

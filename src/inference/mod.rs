pub mod gpt2;
pub mod gpt_service;
pub mod sampling;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use candle::Device;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use gpt_service::{find_weights, locate_weights, GptService};
pub use sampling::SamplingParams;

/// Anything that can turn a prompt into continuation text.
///
/// Calls are synchronous and may be CPU heavy; the HTTP layer runs them on a
/// blocking worker.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Model path not found: {0}. Please ensure the model is in the models/ directory.")]
    MissingPath(String),
    #[error("Model weight file missing. The best_model directory needs pytorch_model.bin, model.safetensors, or model.bin file. Current path: {0}")]
    MissingWeights(String),
    #[error("Error loading model: {0:#}")]
    Other(#[from] anyhow::Error),
}

/// Process-wide generator handle.
///
/// Built exactly once at startup and never replaced. If loading failed the
/// slot keeps the error for the lifetime of the process; recovering requires
/// a restart.
pub struct EngineSlot {
    generator: Option<Arc<dyn TextGenerator>>,
    load_error: Option<String>,
}

impl EngineSlot {
    pub fn loaded(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator: Some(generator),
            load_error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            generator: None,
            load_error: Some(message.into()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.generator.is_some()
    }

    pub fn generator(&self) -> Option<Arc<dyn TextGenerator>> {
        self.generator.clone()
    }

    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }
}

/// Loads the persona model described by `config`. Never fails: errors are
/// logged and kept in the returned slot.
pub fn load_engine(config: &AppConfig) -> EngineSlot {
    match load_generator(config) {
        Ok(service) => EngineSlot::loaded(Arc::new(service)),
        Err(err) => {
            match &err {
                LoadError::Other(cause) => error!(error = ?cause, "failed to load persona model"),
                other => error!("{other}"),
            }
            EngineSlot::failed(err.to_string())
        }
    }
}

fn load_generator(config: &AppConfig) -> Result<GptService, LoadError> {
    let snapshot = resolve_snapshot(config)?;
    let weights = find_weights(&snapshot)?
        .ok_or_else(|| LoadError::MissingWeights(config.model_path.display().to_string()))?;
    let device = select_device(config.cuda_device)?;
    Ok(GptService::load(&snapshot, weights, &config.persona_token, device)?)
}

fn resolve_snapshot(config: &AppConfig) -> Result<PathBuf, LoadError> {
    if config.model_path.exists() {
        return Ok(config.model_path.clone());
    }

    match config.model_repo.as_deref() {
        Some(repo) => {
            warn!(
                path = %config.model_path.display(),
                repo,
                "local model missing, fetching from the hub"
            );
            Ok(fetch_from_hub(repo)?)
        }
        None => Err(LoadError::MissingPath(
            config.model_path.display().to_string(),
        )),
    }
}

fn fetch_from_hub(repo_id: &str) -> Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.model(repo_id.to_string());

    let config = repo.get("config.json")?;
    repo.get("tokenizer.json")?;
    locate_weights(|name| match repo.get(name) {
        Ok(path) => Some(path),
        Err(err) => {
            debug!(repo = repo_id, file = name, error = %err, "not available on the hub");
            None
        }
    })?
    .ok_or_else(|| anyhow!("hub repo {repo_id} has no usable weight files"))?;

    config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("hub cache path has no parent: {}", config.display()))
}

fn select_device(ordinal: usize) -> Result<Device> {
    let device = Device::cuda_if_available(ordinal)?;
    info!(?device, "inference device selected");
    Ok(device)
}

use std::env;
use std::path::PathBuf;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5001";
pub const DEFAULT_MODEL_PATH: &str = "models/michael_jackson_model/best_model";
pub const DEFAULT_PERSONA_TOKEN: &str = "<|michael|>";
pub const DEFAULT_STATIC_DIR: &str = "static";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub model_path: PathBuf,
    /// Hub repo to fetch from when `model_path` does not exist.
    pub model_repo: Option<String>,
    pub persona_token: String,
    pub static_dir: PathBuf,
    pub cuda_device: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            model_repo: None,
            persona_token: DEFAULT_PERSONA_TOKEN.to_string(),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            cuda_device: 0,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            bind_addr: get("CHATBOT_ADDR").unwrap_or(defaults.bind_addr),
            model_path: get("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            model_repo: get("MODEL_REPO"),
            persona_token: get("PERSONA_TOKEN").unwrap_or(defaults.persona_token),
            static_dir: get("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            cuda_device: get("CUDA_DEVICE")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.cuda_device),
        }
    }
}

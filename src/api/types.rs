use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::SamplingParams;

/// JSON body of `POST /`.
///
/// Sampling fields are kept as raw JSON and only converted once the message
/// has been accepted, so `"0.5"` or `50.0` work and a bad value is reported
/// as a generation failure rather than a malformed request.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default, alias = "max_new_tokens")]
    pub max_tokens: Option<Value>,
}

impl ChatRequest {
    pub fn sampling(&self) -> Result<SamplingParams, String> {
        let mut params = SamplingParams::default();
        if let Some(value) = &self.temperature {
            params.temperature = json_temperature(value)?;
        }
        if let Some(value) = &self.max_tokens {
            params.max_new_tokens = json_max_tokens(value)?;
        }
        Ok(params)
    }
}

/// Fields of the HTML form fallback; everything arrives as text.
#[derive(Debug, Default, Deserialize)]
pub struct ChatForm {
    #[serde(default)]
    pub message: String,
    pub temperature: Option<String>,
    pub max_tokens: Option<String>,
}

impl ChatForm {
    pub fn sampling(&self) -> Result<SamplingParams, String> {
        let mut params = SamplingParams::default();
        if let Some(raw) = non_blank(&self.temperature) {
            params.temperature = text_temperature(raw)?;
        }
        if let Some(raw) = non_blank(&self.max_tokens) {
            params.max_new_tokens = text_max_tokens(raw)?;
        }
        Ok(params)
    }
}

fn non_blank(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn json_temperature(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("could not convert temperature to float: {n}")),
        Value::String(raw) => text_temperature(raw.trim()),
        other => Err(format!("temperature must be a number, got {other}")),
    }
}

fn json_max_tokens(value: &Value) -> Result<usize, String> {
    match value {
        Value::Number(n) => {
            // floats truncate toward zero, like an integer cast
            let whole = n.as_i64().or_else(|| n.as_f64().map(f64::trunc).map(|f| f as i64));
            whole
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| format!("invalid value for max_tokens: {n}"))
        }
        Value::String(raw) => text_max_tokens(raw.trim()),
        other => Err(format!("max_tokens must be an integer, got {other}")),
    }
}

fn text_temperature(raw: &str) -> Result<f64, String> {
    raw.parse()
        .map_err(|_| format!("could not convert temperature to float: '{raw}'"))
}

fn text_max_tokens(raw: &str) -> Result<usize, String> {
    raw.parse()
        .map_err(|_| format!("invalid value for max_tokens: '{raw}'"))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub user_message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

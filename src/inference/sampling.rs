use anyhow::{bail, Result};
use std::collections::HashSet;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 100;

/// Per-request knobs forwarded from the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_new_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            bail!(
                "temperature must be a strictly positive float, got {}",
                self.temperature
            );
        }
        if self.max_new_tokens == 0 {
            bail!("max_new_tokens must be greater than 0");
        }
        Ok(())
    }
}

/// Fixed decoding policy of the persona model.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub top_k: usize,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub min_new_tokens: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            top_k: 50,
            top_p: 0.92,
            repetition_penalty: 1.2,
            no_repeat_ngram_size: 3,
            min_new_tokens: 20,
        }
    }
}

/// Tokens that would complete an n-gram already present in `tokens`.
pub fn banned_ngram_tokens(tokens: &[u32], n: usize) -> HashSet<u32> {
    let mut banned = HashSet::new();
    if n == 0 || tokens.len() + 1 < n {
        return banned;
    }
    if n == 1 {
        banned.extend(tokens.iter().copied());
        return banned;
    }

    let prefix = &tokens[tokens.len() - (n - 1)..];
    for window in tokens.windows(n) {
        if &window[..n - 1] == prefix {
            banned.insert(window[n - 1]);
        }
    }
    banned
}

/// Sets the logits of `banned` ids to negative infinity.
pub fn suppress_tokens(logits: &mut [f32], banned: impl IntoIterator<Item = u32>) {
    for id in banned {
        if let Some(slot) = logits.get_mut(id as usize) {
            *slot = f32::NEG_INFINITY;
        }
    }
}

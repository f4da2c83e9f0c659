use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info};

use crate::conversation::{build_persona_prompt, BOS_TOKEN, EOS_TOKEN, PAD_TOKEN};
use crate::inference::gpt2::{Config as Gpt2Config, Gpt2};
use crate::inference::sampling::{
    banned_ngram_tokens, suppress_tokens, GenerationSettings, SamplingParams,
};
use crate::inference::TextGenerator;

/// Weight files found in a snapshot directory.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    Pickle(PathBuf),
}

pub const SAFETENSORS_FILE: &str = "model.safetensors";
pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
/// Pickled checkpoints, in lookup order.
pub const PICKLE_FILES: [&str; 2] = ["pytorch_model.bin", "model.bin"];

/// Looks for weights in the order safetensors, sharded safetensors,
/// `pytorch_model.bin`, `model.bin`.
pub fn find_weights(snapshot_dir: &Path) -> Result<Option<WeightFiles>> {
    locate_weights(|name| Some(snapshot_dir.join(name)).filter(|p| p.is_file()))
}

/// Same lookup as [`find_weights`], but every file goes through `fetch`,
/// which returns a local path when the snapshot has that file. Lets the hub
/// download only what the chosen layout needs.
pub fn locate_weights<F>(mut fetch: F) -> Result<Option<WeightFiles>>
where
    F: FnMut(&str) -> Option<PathBuf>,
{
    if let Some(single) = fetch(SAFETENSORS_FILE) {
        return Ok(Some(WeightFiles::Safetensors(vec![single])));
    }

    if let Some(index_path) = fetch(SAFETENSORS_INDEX_FILE) {
        let shards = shard_names(&index_path)?
            .into_iter()
            .map(|name| {
                fetch(&name).ok_or_else(|| {
                    anyhow!("weight shard {name} listed in {SAFETENSORS_INDEX_FILE} is missing")
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Some(WeightFiles::Safetensors(shards)));
    }

    Ok(PICKLE_FILES
        .iter()
        .find_map(|name| fetch(name))
        .map(WeightFiles::Pickle))
}

fn shard_names(index_path: &Path) -> Result<BTreeSet<String>> {
    let index_json: serde_json::Value = serde_json::from_slice(
        &fs::read(index_path)
            .with_context(|| format!("failed to read {}", index_path.display()))?,
    )?;

    index_json["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("index.json: weight_map is not an object"))?
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in index.json"))
        })
        .collect()
}

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct GptService {
    model: Gpt2,
    tokenizer: Tokenizer,
    device: Device,
    persona_token: String,
    settings: GenerationSettings,
    eos_token: u32,
    final_token: u32,
}

impl GptService {
    pub fn load(
        snapshot_dir: &Path,
        weights: WeightFiles,
        persona_token: &str,
        device: Device,
    ) -> Result<Self> {
        info!(snapshot = %snapshot_dir.display(), ?device, "loading persona model");

        // ---- Tokenizer ----
        let tokenizer_path = snapshot_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("tokenizer error ({}): {e}", tokenizer_path.display()))?;

        // ---- Config ----
        let config_path = snapshot_dir.join("config.json");
        let cfg: Gpt2Config = serde_json::from_slice(
            &fs::read(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?,
        )
        .context("invalid GPT-2 config.json")?;

        // ---- Weights ----
        let vb = match &weights {
            WeightFiles::Safetensors(shards) => {
                debug!(shards = shards.len(), "mmapping safetensors");
                unsafe { VarBuilder::from_mmaped_safetensors(shards, DType::F32, &device)? }
            }
            WeightFiles::Pickle(path) => VarBuilder::from_pth(path, DType::F32, &device)?,
        };
        let model = Gpt2::load(&cfg, vb).context("failed to build GPT-2 from weights")?;

        info!(
            layers = cfg.n_layer,
            vocab = cfg.vocab_size,
            context = cfg.n_positions,
            "persona model loaded"
        );

        Self::from_parts(model, tokenizer, persona_token, device)
    }

    /// Pairs a built model with its tokenizer, registering the special
    /// tokens the persona checkpoint expects.
    fn from_parts(
        model: Gpt2,
        mut tokenizer: Tokenizer,
        persona_token: &str,
        device: Device,
    ) -> Result<Self> {
        let vocab_size = model.config().vocab_size;

        // The fine-tuned checkpoint was trained with these; older tokenizer
        // exports may lack them.
        for special in [BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, persona_token] {
            if tokenizer.token_to_id(special).is_none() {
                tokenizer.add_special_tokens(&[AddedToken::from(special.to_string(), true)]);
            }
            let id = tokenizer
                .token_to_id(special)
                .ok_or_else(|| anyhow!("tokenizer rejected special token {special}"))?;
            if id as usize >= vocab_size {
                bail!(
                    "special token {special} (id {id}) is outside the model vocabulary of {vocab_size}"
                );
            }
        }

        let eos_token = tokenizer
            .token_to_id(EOS_TOKEN)
            .ok_or_else(|| anyhow!("tokenizer has no {EOS_TOKEN} token"))?;
        let final_token = tokenizer
            .encode(".", false)
            .map_err(|e| anyhow!("tokenizer encode error: {e}"))?
            .get_ids()
            .last()
            .copied()
            .ok_or_else(|| anyhow!("tokenizer produced no id for '.'"))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            persona_token: persona_token.to_string(),
            settings: GenerationSettings::default(),
            eos_token,
            final_token,
        })
    }

    fn sample_next(
        &self,
        lp: &mut LogitsProcessor,
        logits: &Tensor,
        tokens: &[u32],
        generated: usize,
    ) -> Result<u32> {
        let logits = if self.settings.repetition_penalty != 1.0 {
            apply_repeat_penalty(logits, self.settings.repetition_penalty, tokens)?
        } else {
            logits.clone()
        };

        let mut scores = logits.to_vec1::<f32>()?;
        suppress_tokens(
            &mut scores,
            banned_ngram_tokens(tokens, self.settings.no_repeat_ngram_size),
        );
        if generated < self.settings.min_new_tokens {
            suppress_tokens(&mut scores, [self.eos_token]);
        }

        let scores = Tensor::new(scores.as_slice(), &Device::Cpu)?;
        Ok(lp.sample(&scores)?)
    }

    fn generate_ids(&self, mut tokens: Vec<u32>, params: &SamplingParams) -> Result<Vec<u32>> {
        let n_ctx = self.model.config().n_positions;
        let prompt_len = tokens.len();
        if prompt_len == 0 {
            bail!("prompt encoded to zero tokens");
        }
        if prompt_len >= n_ctx {
            bail!("prompt is {prompt_len} tokens, the model context is {n_ctx}");
        }

        let budget = params.max_new_tokens.min(n_ctx - prompt_len);
        let mut lp = LogitsProcessor::from_sampling(
            rand::random(),
            Sampling::TopKThenTopP {
                k: self.settings.top_k,
                p: self.settings.top_p,
                temperature: params.temperature,
            },
        );
        let mut cache = self.model.new_cache();

        for step in 0..budget {
            // last budgeted token is forced to end the sentence
            if step + 1 == budget {
                tokens.push(self.final_token);
                break;
            }

            let ctx = &tokens[cache.seq_len()..];
            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, &mut cache)?.squeeze(0)?;

            let next = self.sample_next(&mut lp, &logits, &tokens, step)?;
            tokens.push(next);
            if next == self.eos_token {
                break;
            }
        }

        Ok(tokens.split_off(prompt_len))
    }
}

impl TextGenerator for GptService {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        params.validate()?;

        let input = build_persona_prompt(prompt, &self.persona_token);
        let enc = self
            .tokenizer
            .encode(input, false)
            .map_err(|e| anyhow!("tokenizer encode error: {e}"))?;

        let generated = self.generate_ids(enc.get_ids().to_vec(), params)?;
        debug!(tokens = generated.len(), "generation finished");

        self.tokenizer
            .decode(&generated, true)
            .map_err(|e| anyhow!("tokenizer decode error: {e}"))
    }
}

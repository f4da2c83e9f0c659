use candle::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

// ---------------------------------------------------------
// Config (subset of the HF GPT-2 config.json)
// ---------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_n_positions() -> usize {
    1024
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Config {
    fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

// ---------------------------------------------------------
// Per-call KV cache
// ---------------------------------------------------------
/// Keys/values of every layer for one generation run. Owned by the caller so
/// the model itself stays immutable and shareable.
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
    seq_len: usize,
}

impl KvCache {
    pub fn new(n_layer: usize) -> Self {
        Self {
            layers: vec![None; n_layer],
            seq_len: 0,
        }
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }
}

/// HF GPT-2 stores its projections as `Conv1D` with `[in, out]` weights.
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.dims();
    let mask = mask.broadcast_as(shape)?;
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape)?;
    mask.where_cond(&on_true, on_false)
}

/// `mask[i][j] == 1` where query `i` (at absolute position `offset + i`)
/// must not see key `j`.
fn causal_mask(q_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let k_len = offset + q_len;
    let mask: Vec<u8> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| u8::from(j > offset + i)))
        .collect();
    Tensor::from_slice(&mask, (q_len, k_len), device)
}

struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let c_attn = conv1d(cfg.n_embd, 3 * cfg.n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: cfg.n_head,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, xs: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        xs.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(
        &self,
        xs: &Tensor,
        cache: &mut Option<(Tensor, Tensor)>,
        offset: usize,
    ) -> Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;
        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, c)?, b, t)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, c, c)?, b, t)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * c, c)?, b, t)?;

        let (k, v) = match cache.as_ref() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));

        let scale = (self.head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let att = if t > 1 {
            let mask = causal_mask(t, offset, xs.device())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        } else {
            att
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;

        let ys = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, c))?;
        self.c_proj.forward(&ys)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: conv1d(cfg.n_embd, 4 * cfg.n_embd, vb.pp("c_fc"))?,
            c_proj: conv1d(4 * cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // gelu() is the tanh approximation ("gelu_new")
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cache: &mut Option<(Tensor, Tensor)>,
        offset: usize,
    ) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?, cache, offset)?)?;
        let ys = self.mlp.forward(&self.ln_2.forward(&xs)?)?;
        xs + ys
    }
}

// ---------------------------------------------------------
// GPT-2 LM head model
// ---------------------------------------------------------
pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Config,
}

impl Gpt2 {
    /// Accepts both `GPT2LMHeadModel` checkpoints (`transformer.` prefix) and
    /// bare `GPT2Model` ones. The LM head is tied to `wte`.
    pub fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(cfg.vocab_size, cfg.n_embd, vb.pp("wte"))?;
        let wpe = embedding(cfg.n_positions, cfg.n_embd, vb.pp("wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::load(cfg, vb.pp("h").pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.blocks.len())
    }

    /// Runs `ids` (shape `[batch, seq]`) after whatever `cache` already holds
    /// and returns the logits of the last position, shape `[batch, vocab]`.
    pub fn forward(&self, ids: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let (_b, t) = ids.dims2()?;
        let offset = cache.seq_len;
        if offset + t > self.config.n_positions {
            candle::bail!(
                "sequence of {} tokens exceeds the context window of {}",
                offset + t,
                self.config.n_positions
            );
        }

        let positions = Tensor::arange(offset as u32, (offset + t) as u32, ids.device())?
            .unsqueeze(0)?;
        let mut xs = self
            .wte
            .forward(ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        for (block, layer_cache) in self.blocks.iter().zip(cache.layers.iter_mut()) {
            xs = block.forward(&xs, layer_cache, offset)?;
        }
        cache.seq_len += t;

        let last = xs.i((.., t - 1, ..))?;
        let last = self.ln_f.forward(&last)?;
        self.lm_head.forward(&last)?.to_dtype(DType::F32)
    }
}

/// Tiny randomly initialised GPT-2 for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    pub fn tiny_config() -> Config {
        Config {
            vocab_size: 11,
            n_positions: 16,
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
        }
    }

    pub fn random_weights(cfg: &Config, prefix: &str) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let e = cfg.n_embd;
        let mut shapes: Vec<(String, Vec<usize>)> = vec![
            ("wte.weight".into(), vec![cfg.vocab_size, e]),
            ("wpe.weight".into(), vec![cfg.n_positions, e]),
            ("ln_f.weight".into(), vec![e]),
            ("ln_f.bias".into(), vec![e]),
        ];
        for i in 0..cfg.n_layer {
            let p = format!("h.{i}");
            shapes.extend([
                (format!("{p}.ln_1.weight"), vec![e]),
                (format!("{p}.ln_1.bias"), vec![e]),
                (format!("{p}.ln_2.weight"), vec![e]),
                (format!("{p}.ln_2.bias"), vec![e]),
                (format!("{p}.attn.c_attn.weight"), vec![e, 3 * e]),
                (format!("{p}.attn.c_attn.bias"), vec![3 * e]),
                (format!("{p}.attn.c_proj.weight"), vec![e, e]),
                (format!("{p}.attn.c_proj.bias"), vec![e]),
                (format!("{p}.mlp.c_fc.weight"), vec![e, 4 * e]),
                (format!("{p}.mlp.c_fc.bias"), vec![4 * e]),
                (format!("{p}.mlp.c_proj.weight"), vec![4 * e, e]),
                (format!("{p}.mlp.c_proj.bias"), vec![e]),
            ]);
        }

        shapes
            .into_iter()
            .map(|(name, shape)| {
                let t = Tensor::randn(0f32, 0.5, shape, &dev).unwrap();
                (format!("{prefix}{name}"), t)
            })
            .collect()
    }

    pub fn model_from(cfg: &Config, weights: HashMap<String, Tensor>) -> Gpt2 {
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        Gpt2::load(cfg, vb).unwrap()
    }
}

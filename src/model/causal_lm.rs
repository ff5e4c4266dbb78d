//! Decoder-only causal language model with a tied output head

use super::{DecoderLayer, LayerNorm, ModelConfig, WeightStore, POSITION_OFFSET};
use crate::autograd::{add, dropout, embedding, matmul_nt, Context};
use crate::lora::{self, LoRAConfig, LoRALinear, PeftAdapterConfig};
use crate::{Error, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

/// Module path prefix of decoder layers in PEFT adapter files
const LAYER_PATH: &str = "model.decoder.layers";

/// OPT-style decoder with learned positions and a final LayerNorm
///
/// The output projection reuses the token embedding matrix.
pub struct CausalLm {
    config: ModelConfig,
    embed_tokens: Tensor,
    embed_positions: Tensor,
    layers: Vec<DecoderLayer>,
    final_layer_norm: LayerNorm,
    lora_config: Option<LoRAConfig>,
}

impl CausalLm {
    /// Build a frozen model whose weights share the store's buffers
    pub fn from_store(config: &ModelConfig, store: &WeightStore) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;

        let embed_tokens = Tensor::from_shared(
            store.get("decoder.embed_tokens.weight", &[config.vocab_size, hidden])?,
            false,
        );
        let embed_positions = Tensor::from_shared(
            store.get(
                "decoder.embed_positions.weight",
                &[config.max_position_embeddings + POSITION_OFFSET, hidden],
            )?,
            false,
        );
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::from_store(store, &format!("decoder.layers.{i}"), config))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm = LayerNorm::from_store(
            store,
            "decoder.final_layer_norm",
            hidden,
            config.layer_norm_eps,
        )?;

        Ok(Self {
            config: config.clone(),
            embed_tokens,
            embed_positions,
            layers,
            final_layer_norm,
            lora_config: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Next-token logits, `[batch * seq_len, vocab_size]` row-major
    pub fn forward(&self, input_ids: &[u32], batch: usize, seq_len: usize, ctx: &mut Context) -> Result<Tensor> {
        if input_ids.len() != batch * seq_len {
            return Err(Error::ShapeMismatch {
                name: "input_ids".to_string(),
                expected: vec![batch, seq_len],
                got: vec![input_ids.len()],
            });
        }
        if seq_len > self.config.max_position_embeddings {
            return Err(Error::InvalidParameter(format!(
                "sequence length {seq_len} exceeds max_position_embeddings {}",
                self.config.max_position_embeddings
            )));
        }
        if let Some(&id) = input_ids.iter().find(|&&id| id as usize >= self.config.vocab_size) {
            return Err(Error::InvalidParameter(format!(
                "token id {id} is outside the vocabulary of {}",
                self.config.vocab_size
            )));
        }

        let hidden = self.config.hidden_size;
        let rows = batch * seq_len;

        let positions: Vec<u32> = (0..batch)
            .flat_map(|_| (0..seq_len).map(|i| (i + POSITION_OFFSET) as u32))
            .collect();
        let tokens = embedding(&self.embed_tokens, input_ids, hidden);
        let pos = embedding(&self.embed_positions, &positions, hidden);
        let mut h = dropout(&add(&tokens, &pos), self.config.dropout, ctx);

        for layer in &self.layers {
            h = layer.forward(&h, batch, seq_len, ctx);
        }
        let h = self.final_layer_norm.forward(&h, rows);

        Ok(matmul_nt(&h, &self.embed_tokens, rows, hidden, self.config.vocab_size))
    }

    /// Inject adapters into every projection selected by `config`
    ///
    /// Adapter A matrices are drawn from a generator seeded with `seed`, so
    /// models built with the same seed start from identical adapters.
    pub fn apply_lora(&mut self, config: &LoRAConfig, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            for (name, projection) in layer.projections_mut() {
                if config.should_apply(name, Some(i)) {
                    projection.adapt(config, &mut rng);
                }
            }
        }
        self.lora_config = Some(config.clone());
        tracing::debug!(adapters = self.lora_layers().len(), "applied LoRA");
    }

    /// Log the trainable share of the parameters
    pub fn print_trainable_parameters(&self) {
        let trainable = self.num_trainable();
        let total = self.num_parameters();
        tracing::info!(
            "trainable params: {trainable} || all params: {total} || trainable%: {:.4}",
            100.0 * trainable as f64 / total.max(1) as f64
        );
    }

    pub fn lora_config(&self) -> Option<&LoRAConfig> {
        self.lora_config.as_ref()
    }

    /// Adapted projections keyed by their PEFT module path
    pub fn lora_layers(&self) -> Vec<(String, &LoRALinear)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            for (name, projection) in layer.projections() {
                if let Some(lora) = projection.lora() {
                    out.push((module_path(i, name), lora));
                }
            }
        }
        out
    }

    pub fn lora_layers_mut(&mut self) -> Vec<(String, &mut LoRALinear)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            for (name, projection) in layer.projections_mut() {
                if let Some(lora) = projection.lora_mut() {
                    out.push((module_path(i, name), lora));
                }
            }
        }
        out
    }

    /// Trainable tensors in a fixed order (layer, projection, A then B)
    pub fn trainable_parameters(&self) -> Vec<&Tensor> {
        self.lora_layers()
            .into_iter()
            .flat_map(|(_, lora)| [lora.lora_a(), lora.lora_b()])
            .collect()
    }

    pub fn trainable_parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.lora_layers_mut()
            .into_iter()
            .flat_map(|(_, lora)| lora.trainable_params())
            .collect()
    }

    /// All parameters; the tied output head is counted once
    pub fn num_parameters(&self) -> usize {
        self.embed_tokens.len()
            + self.embed_positions.len()
            + self.final_layer_norm.num_parameters()
            + self.layers.iter().map(DecoderLayer::num_parameters).sum::<usize>()
    }

    pub fn num_trainable(&self) -> usize {
        self.lora_layers().iter().map(|(_, l)| l.num_trainable()).sum()
    }

    /// Write the adapters as a PEFT adapter directory
    pub fn save_adapter(&self, dir: &Path, base_model: Option<&str>) -> Result<()> {
        let config = self
            .lora_config
            .as_ref()
            .ok_or_else(|| Error::ConfigError("model has no LoRA adapters to save".to_string()))?;
        lora::save_adapter(dir, config, base_model, &self.lora_layers())
    }

    /// Load adapter weights, injecting adapters first if the model has none
    pub fn load_adapter(&mut self, dir: &Path) -> Result<PeftAdapterConfig> {
        if self.lora_config.is_none() {
            let json = std::fs::read_to_string(dir.join(lora::ADAPTER_CONFIG_FILE))?;
            let peft: PeftAdapterConfig = serde_json::from_str(&json)?;
            self.apply_lora(&peft.to_lora_config(), 0);
        }
        lora::load_adapter(dir, self.lora_layers_mut())
    }
}

fn module_path(layer: usize, name: &str) -> String {
    match name {
        "fc1" | "fc2" => format!("{LAYER_PATH}.{layer}.{name}"),
        _ => format!("{LAYER_PATH}.{layer}.self_attn.{name}"),
    }
}

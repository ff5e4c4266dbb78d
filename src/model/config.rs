//! Decoder configuration read from `config.json`

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feed-forward activation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
}

/// Hyperparameters of an OPT-style decoder
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub ffn_dim: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_activation")]
    pub activation_function: Activation,
    #[serde(default = "default_true")]
    pub do_layer_norm_before: bool,
    #[serde(default)]
    pub word_embed_proj_dim: Option<usize>,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_true")]
    pub enable_bias: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_activation() -> Activation {
    Activation::Relu
}

fn default_true() -> bool {
    true
}

fn default_dropout() -> f32 {
    0.1
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

/// Learned position ids start this far into the position table
pub const POSITION_OFFSET: usize = 2;

impl ModelConfig {
    /// Read and check a `config.json`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::ConfigError(format!("Invalid model config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject variants the decoder does not implement
    pub fn validate(&self) -> Result<()> {
        if let Some(proj) = self.word_embed_proj_dim {
            if proj != self.hidden_size {
                return Err(Error::ConfigError(format!(
                    "word_embed_proj_dim {proj} != hidden_size {} is not supported",
                    self.hidden_size
                )));
            }
        }
        if !self.do_layer_norm_before {
            return Err(Error::ConfigError(
                "post-LayerNorm decoders (do_layer_norm_before = false) are not supported"
                    .to_string(),
            ));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::ConfigError(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::ConfigError(format!(
                "dropout {} must be in [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

//! OPT-style decoder built from safetensors checkpoints
//!
//! Frozen weights live in a [`WeightStore`] and are shared by every model
//! replica built from it; only injected LoRA adapters own their buffers.

mod attention;
mod causal_lm;
mod config;
mod layer;
mod linear;
mod weights;

#[cfg(test)]
pub(crate) mod testing;

pub use attention::SelfAttention;
pub use causal_lm::CausalLm;
pub use config::{Activation, ModelConfig, POSITION_OFFSET};
pub use layer::{DecoderLayer, LayerNorm};
pub use linear::{Linear, Projection};
pub use weights::{write_safetensors, WeightStore};

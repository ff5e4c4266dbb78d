//! LoRA (Low-Rank Adaptation) implementation
//!
//! LoRA enables parameter-efficient fine-tuning of large pretrained models
//! by adding trainable low-rank decomposition matrices to frozen weights.

mod adapter;
mod config;
mod layer;

pub use adapter::{
    load_adapter, save_adapter, PeftAdapterConfig, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE,
};
pub use config::{LoRAConfig, ALL_LINEAR, LINEAR_MODULES};
pub use layer::LoRALinear;

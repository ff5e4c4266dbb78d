//! # afinar: LoRA instruction fine-tuning
//!
//! afinar fine-tunes a decoder-only causal language model on the Dolly
//! instruction dataset with low-rank adaptation, entirely on CPU threads.
//!
//! ## Architecture
//!
//! - **data**: Prompt formatting, JSONL loading, packing, collation, sampling
//! - **hub**: Local-or-Hub resolution of model and dataset files
//! - **tokenizer**: `tokenizer.json` loading with pad = EOS
//! - **autograd**: Tape-based automatic differentiation
//! - **model**: OPT-style decoder loaded from safetensors
//! - **lora**: Low-rank adapters and PEFT-compatible adapter files
//! - **optim**: AdamW, linear schedule, gradient clipping
//! - **train**: Causal LM loss and the supervised fine-tuning trainer
//! - **distributed**: Replica worker pool with gradient all-reduce
//! - **config**: CLI and declarative YAML configuration
//! - **finetune**: The end-to-end pipeline

pub mod autograd;
pub mod config;
pub mod data;
pub mod distributed;
pub mod finetune;
pub mod hub;
pub mod lora;
pub mod model;
pub mod optim;
pub mod tokenizer;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Context, Tensor};
pub use error::{Error, Result};
pub use finetune::{train_model, TrainSummary};

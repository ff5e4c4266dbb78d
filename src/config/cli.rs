//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! afinar --model_id facebook/opt-125m --num_cores 8 --num_epochs 3
//! afinar --config finetune.yaml --lr 1e-4
//! afinar --config finetune.yaml --dry_run
//! ```
//!
//! Flags that are given override the YAML file, which overrides the
//! built-in defaults.

use super::FinetuneSpec;
use clap::Parser;
use std::path::PathBuf;

/// afinar: LoRA instruction fine-tuning of causal language models
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "afinar")]
#[command(version)]
#[command(about = "LoRA fine-tuning of a causal language model on Dolly-15k")]
pub struct Cli {
    /// Base model hub id or local directory [default: facebook/opt-125m]
    #[arg(long = "model_id", value_name = "ID")]
    pub model_id: Option<String>,

    /// Number of replica worker threads [default: 8]
    #[arg(long = "num_cores", value_name = "N")]
    pub num_cores: Option<usize>,

    /// Number of training epochs [default: 3]
    #[arg(long = "num_epochs", value_name = "N")]
    pub num_epochs: Option<usize>,

    /// Micro-batch size per replica [default: 16]
    #[arg(long = "train_batch_size", value_name = "N")]
    pub train_batch_size: Option<usize>,

    /// Base learning rate, scaled by num_cores [default: 3e-4]
    #[arg(long = "lr", value_name = "LR")]
    pub lr: Option<f32>,

    /// YAML configuration file
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Dataset hub id or local JSONL file [default: databricks/databricks-dolly-15k]
    #[arg(long = "dataset", value_name = "ID")]
    pub dataset: Option<String>,

    /// Output directory for checkpoints and the adapter [default: output]
    #[arg(long = "output_dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Packed sequence length [default: 1024]
    #[arg(long = "max_seq_length", value_name = "N")]
    pub max_seq_length: Option<usize>,

    /// Random seed [default: 42]
    #[arg(long = "seed", value_name = "SEED")]
    pub seed: Option<u64>,

    /// Validate the configuration and print the plan without training
    #[arg(long = "dry_run")]
    pub dry_run: bool,

    /// Enable debug output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress all output except warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Parse arguments (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply command-line overrides to a FinetuneSpec
pub fn apply_overrides(spec: &mut FinetuneSpec, cli: &Cli) {
    if let Some(model_id) = &cli.model_id {
        spec.model.id = model_id.clone();
    }
    if let Some(num_cores) = cli.num_cores {
        spec.distributed.num_cores = num_cores;
    }
    if let Some(epochs) = cli.num_epochs {
        spec.training.num_epochs = epochs;
    }
    if let Some(batch_size) = cli.train_batch_size {
        spec.training.train_batch_size = batch_size;
    }
    if let Some(lr) = cli.lr {
        spec.training.lr = lr;
    }
    if let Some(dataset) = &cli.dataset {
        spec.data.dataset = dataset.clone();
    }
    if let Some(output_dir) = &cli.output_dir {
        spec.training.output_dir = output_dir.clone();
    }
    if let Some(max_seq_length) = cli.max_seq_length {
        spec.data.max_seq_length = max_seq_length;
    }
    if let Some(seed) = cli.seed {
        spec.training.seed = seed;
    }
}

//! YAML schema for declarative fine-tuning configuration

use crate::data::DOLLY_DATASET_ID;
use crate::lora::LoRAConfig;
use crate::train::TrainingArguments;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete fine-tuning configuration
///
/// Every section and field is optional in YAML; missing values take the
/// defaults below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneSpec {
    pub model: ModelSpec,
    pub data: DataSpec,
    pub lora: LoRASpec,
    pub training: TrainingSpec,
    pub distributed: DistributedSpec,
}

/// Base model reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Hub repository id or local directory
    pub id: String,

    /// Hub revision (branch, tag or commit)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Download cache, instead of the hf-hub default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            id: "facebook/opt-125m".to_string(),
            revision: None,
            cache_dir: None,
        }
    }
}

/// Dataset and sequence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSpec {
    /// Hub dataset id or local JSONL file
    pub dataset: String,

    /// Length of every packed training block
    pub max_seq_length: usize,
}

impl Default for DataSpec {
    fn default() -> Self {
        Self {
            dataset: DOLLY_DATASET_ID.to_string(),
            max_seq_length: 1024,
        }
    }
}

/// LoRA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoRASpec {
    /// Rank of low-rank decomposition
    pub rank: usize,

    /// Scaling factor (alpha)
    pub alpha: f32,

    /// Dropout probability on the adapter input
    pub dropout: f32,

    /// Target modules (e.g., [q_proj, v_proj])
    pub target_modules: Vec<String>,

    /// Restrict adapters to these layer indices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<usize>>,
}

impl Default for LoRASpec {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.05,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            layers: None,
        }
    }
}

impl LoRASpec {
    pub fn to_lora_config(&self) -> LoRAConfig {
        let modules: Vec<&str> = self.target_modules.iter().map(String::as_str).collect();
        let config = LoRAConfig::new(self.rank, self.alpha)
            .with_dropout(self.dropout)
            .target_modules(&modules);
        match &self.layers {
            Some(layers) => config.target_layers(layers),
            None => config,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSpec {
    pub output_dir: PathBuf,
    pub num_epochs: usize,
    /// Micro-batch size of each replica
    pub train_batch_size: usize,
    /// Base learning rate, multiplied by the number of replicas
    pub lr: f32,
    pub gradient_accumulation_steps: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub max_grad_norm: f32,
    pub weight_decay: f32,
    pub warmup_steps: usize,
    pub seed: u64,
    /// Stop after this many logs without a lower loss
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingSpec {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            num_epochs: 3,
            train_batch_size: 16,
            lr: 3e-4,
            gradient_accumulation_steps: 2,
            logging_steps: 10,
            save_steps: 500,
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            warmup_steps: 0,
            seed: 42,
            early_stopping_patience: None,
        }
    }
}

/// Worker pool size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedSpec {
    /// Number of replica threads
    pub num_cores: usize,
}

impl Default for DistributedSpec {
    fn default() -> Self {
        Self { num_cores: 8 }
    }
}

impl FinetuneSpec {
    pub fn lora_config(&self) -> LoRAConfig {
        self.lora.to_lora_config()
    }

    /// Learning rate after scaling by the number of replicas
    pub fn scaled_lr(&self) -> f32 {
        self.training.lr * self.distributed.num_cores as f32
    }

    /// Trainer arguments with the scaled learning rate
    pub fn training_arguments(&self) -> TrainingArguments {
        let t = &self.training;
        TrainingArguments {
            output_dir: t.output_dir.clone(),
            per_device_train_batch_size: t.train_batch_size,
            learning_rate: self.scaled_lr(),
            gradient_accumulation_steps: t.gradient_accumulation_steps,
            num_train_epochs: t.num_epochs,
            logging_steps: t.logging_steps,
            save_steps: t.save_steps,
            max_grad_norm: t.max_grad_norm,
            weight_decay: t.weight_decay,
            warmup_steps: t.warmup_steps,
            seed: t.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let spec: FinetuneSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec, FinetuneSpec::default());
        assert_eq!(spec.model.id, "facebook/opt-125m");
        assert_eq!(spec.data.dataset, "databricks/databricks-dolly-15k");
        assert_eq!(spec.distributed.num_cores, 8);
        assert_eq!(spec.training.train_batch_size, 16);
        assert_eq!(spec.training.num_epochs, 3);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
model:
  id: ./tiny-opt
training:
  lr: 0.001
  num_epochs: 1
lora:
  rank: 8
  target_modules: [q_proj, k_proj, v_proj]
distributed:
  num_cores: 2
"#;
        let spec: FinetuneSpec = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(spec.model.id, "./tiny-opt");
        assert_eq!(spec.training.num_epochs, 1);
        assert_eq!(spec.training.train_batch_size, 16);
        assert_eq!(spec.lora.rank, 8);
        assert_eq!(spec.lora.alpha, 32.0);
        assert_eq!(spec.data.max_seq_length, 1024);
    }

    #[test]
    fn test_lr_scaled_by_world_size() {
        let mut spec = FinetuneSpec::default();
        spec.distributed.num_cores = 4;
        let args = spec.training_arguments();

        assert!((args.learning_rate - 1.2e-3).abs() < 1e-9);
        assert_eq!(args.gradient_accumulation_steps, 2);
        assert_eq!(args.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn test_lora_spec_conversion() {
        let config = FinetuneSpec::default().lora_config();
        assert_eq!(config, LoRAConfig::default());
    }
}

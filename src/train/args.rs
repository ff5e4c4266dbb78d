//! Training arguments

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hyperparameters of a fine-tuning run
///
/// `learning_rate` is the rate the optimizer uses, already scaled for the
/// number of replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Directory for checkpoints and the final adapter
    pub output_dir: PathBuf,

    /// Micro-batch size of each replica
    pub per_device_train_batch_size: usize,

    pub learning_rate: f32,

    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,

    pub num_train_epochs: usize,

    /// Log every N optimizer steps
    pub logging_steps: usize,

    /// Save a checkpoint every N optimizer steps (0 disables)
    pub save_steps: usize,

    /// Global gradient norm bound (0 disables clipping)
    pub max_grad_norm: f32,

    pub weight_decay: f32,

    pub warmup_steps: usize,

    pub seed: u64,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            per_device_train_batch_size: 16,
            learning_rate: 3e-4,
            gradient_accumulation_steps: 2,
            num_train_epochs: 3,
            logging_steps: 10,
            save_steps: 500,
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            warmup_steps: 0,
            seed: 42,
        }
    }
}

impl TrainingArguments {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Set gradient accumulation steps
    ///
    /// Effective batch size = batch_size * gradient_accumulation_steps * replicas
    pub fn with_gradient_accumulation(mut self, steps: usize) -> Self {
        self.gradient_accumulation_steps = steps.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.per_device_train_batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.num_train_epochs = epochs;
        self
    }

    pub fn with_logging_steps(mut self, steps: usize) -> Self {
        self.logging_steps = steps;
        self
    }

    pub fn with_save_steps(mut self, steps: usize) -> Self {
        self.save_steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Optimizer steps per epoch for `num_batches` micro-batches
    pub fn steps_per_epoch(&self, num_batches: usize) -> usize {
        num_batches.div_ceil(self.gradient_accumulation_steps.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 {
            return Err(Error::InvalidParameter(
                "per_device_train_batch_size must be positive".to_string(),
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(Error::InvalidParameter(
                "gradient_accumulation_steps must be positive".to_string(),
            ));
        }
        if self.logging_steps == 0 {
            return Err(Error::InvalidParameter("logging_steps must be positive".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = TrainingArguments::default();
        assert_eq!(args.output_dir, PathBuf::from("output"));
        assert_eq!(args.gradient_accumulation_steps, 2);
        assert_eq!(args.logging_steps, 10);
        assert_eq!(args.save_steps, 500);
        assert_eq!(args.max_grad_norm, 1.0);
        assert_eq!(args.seed, 42);
        args.validate().unwrap();
    }

    #[test]
    fn test_steps_per_epoch_rounds_up() {
        let args = TrainingArguments::default().with_gradient_accumulation(2);
        assert_eq!(args.steps_per_epoch(5), 3);
        assert_eq!(args.steps_per_epoch(4), 2);
        assert_eq!(args.steps_per_epoch(0), 0);
    }

    #[test]
    fn test_gradient_accumulation_min_value() {
        let args = TrainingArguments::default().with_gradient_accumulation(0);
        assert_eq!(args.gradient_accumulation_steps, 1);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let args = TrainingArguments::default().with_batch_size(0);
        assert!(matches!(args.validate(), Err(Error::InvalidParameter(_))));
        assert!(TrainingArguments::default().with_learning_rate(0.0).validate().is_err());
    }
}

//! Configuration validation

use super::schema::FinetuneSpec;
use crate::lora::{ALL_LINEAR, LINEAR_MODULES};

/// Validation error type
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Model id must not be empty")]
    EmptyModelId,

    #[error("Dataset must not be empty")]
    EmptyDataset,

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f32),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid num_cores: {0} (must be > 0)")]
    InvalidNumCores(usize),

    #[error("Invalid max_seq_length: {0} (must be > 0)")]
    InvalidSeqLength(usize),

    #[error("Invalid gradient accumulation steps: {0} (must be > 0)")]
    InvalidAccumulation(usize),

    #[error("Invalid logging steps: {0} (must be > 0)")]
    InvalidLoggingSteps(usize),

    #[error("Invalid LoRA rank: {0} (must be > 0)")]
    InvalidLoRARank(usize),

    #[error("Invalid LoRA dropout: {0} (must be in [0, 1))")]
    InvalidLoRADropout(f32),

    #[error("LoRA target_modules must not be empty")]
    EmptyTargetModules,

    #[error("Unknown LoRA target module: {0} (must be one of: q_proj, k_proj, v_proj, out_proj, fc1, fc2, all-linear)")]
    UnknownTargetModule(String),

    #[error("Invalid gradient clip value: {0} (must be >= 0.0)")]
    InvalidGradClip(f32),
}

/// Validate a fine-tuning configuration
///
/// Checks numeric ranges and LoRA target names. Paths and hub ids are
/// resolved later, when the pipeline fetches them.
pub fn validate_config(spec: &FinetuneSpec) -> Result<(), ValidationError> {
    if spec.model.id.trim().is_empty() {
        return Err(ValidationError::EmptyModelId);
    }
    if spec.data.dataset.trim().is_empty() {
        return Err(ValidationError::EmptyDataset);
    }
    if spec.data.max_seq_length == 0 {
        return Err(ValidationError::InvalidSeqLength(0));
    }

    let training = &spec.training;
    if !(training.lr.is_finite() && training.lr > 0.0) {
        return Err(ValidationError::InvalidLearningRate(training.lr));
    }
    if training.train_batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize(0));
    }
    if training.num_epochs == 0 {
        return Err(ValidationError::InvalidEpochs(0));
    }
    if training.gradient_accumulation_steps == 0 {
        return Err(ValidationError::InvalidAccumulation(0));
    }
    if training.logging_steps == 0 {
        return Err(ValidationError::InvalidLoggingSteps(0));
    }
    if training.max_grad_norm < 0.0 {
        return Err(ValidationError::InvalidGradClip(training.max_grad_norm));
    }

    if spec.distributed.num_cores == 0 {
        return Err(ValidationError::InvalidNumCores(0));
    }

    let lora = &spec.lora;
    if lora.rank == 0 {
        return Err(ValidationError::InvalidLoRARank(0));
    }
    if !(0.0..1.0).contains(&lora.dropout) {
        return Err(ValidationError::InvalidLoRADropout(lora.dropout));
    }
    if lora.target_modules.is_empty() {
        return Err(ValidationError::EmptyTargetModules);
    }
    if let Some(unknown) = lora
        .target_modules
        .iter()
        .find(|m| m.as_str() != ALL_LINEAR && !LINEAR_MODULES.contains(&m.as_str()))
    {
        return Err(ValidationError::UnknownTargetModule(unknown.clone()));
    }

    Ok(())
}

//! End-to-end fine-tuning pipeline
//!
//! ```text
//! dataset -> prompts -> tokenizer -> scaled lr -> model -> LoRA
//!         -> training arguments -> trainer (one per replica) -> adapter
//! ```
//!
//! Frozen weights are loaded once and shared by every replica; each replica
//! owns its adapters and optimizer state and averages gradients with its
//! peers at every optimizer step.

use crate::config::{validate_config, FinetuneSpec};
use crate::data::{format_dataset, load_records, pack_sequences, CausalLmCollator, DOLLY_FILE};
use crate::distributed::{run_workers, Collective};
use crate::hub::HubFetcher;
use crate::model::{CausalLm, ModelConfig, WeightStore};
use crate::tokenizer::TextTokenizer;
use crate::train::{EarlyStopping, NanGuard, Trainer};
use crate::{Error, Result};
use std::path::PathBuf;

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// Optimizer steps taken
    pub steps: usize,
    /// Epochs requested
    pub epochs: usize,
    /// Mean loss of the last optimizer step
    pub final_loss: f32,
    /// Mean loss over all optimizer steps
    pub train_loss: f32,
    /// Wall-clock training time in seconds
    pub elapsed_secs: f64,
    /// Directory holding the final adapter
    pub output_dir: PathBuf,
    /// Packed training blocks
    pub num_blocks: usize,
    /// Whether a callback ended training before the planned step count
    pub stopped_early: bool,
}

/// Fine-tune the model described by `spec` and save its adapter
pub fn train_model(spec: &FinetuneSpec) -> Result<TrainSummary> {
    validate_config(spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;

    let mut hub = HubFetcher::new();
    if let Some(dir) = &spec.model.cache_dir {
        hub = hub.cache_dir(dir.clone());
    }

    let dataset_path = hub.fetch_dataset(&spec.data.dataset, DOLLY_FILE)?;
    let records = load_records(&dataset_path)?;
    let samples = format_dataset(&records);
    if samples.is_empty() {
        return Err(Error::Dataset(format!(
            "{} contains no records",
            dataset_path.display()
        )));
    }

    // The revision pins the model repository only
    let model_hub = match &spec.model.revision {
        Some(rev) => hub.revision(rev.clone()),
        None => hub,
    };
    let files = model_hub.fetch_model(&spec.model.id)?;
    let tokenizer = TextTokenizer::load(&files)?;

    let world_size = spec.distributed.num_cores;
    let args = spec.training_arguments();
    tracing::info!(
        base_lr = spec.training.lr,
        world_size,
        lr = args.learning_rate,
        "scaled learning rate"
    );

    let model_config = ModelConfig::from_file(&files.config)?;
    let store = WeightStore::load(&files.weights)?;
    tracing::info!(
        model = %spec.model.id,
        tensors = store.len(),
        parameters = store.num_parameters(),
        "loaded base model"
    );

    let lora_config = spec.lora_config();

    let seq_len = spec
        .data
        .max_seq_length
        .min(model_config.max_position_embeddings);
    let texts: Vec<&str> = samples.iter().map(|s| s.text.as_str()).collect();
    let token_ids = tokenizer.encode_batch(&texts, true)?;
    let blocks = pack_sequences(&token_ids, tokenizer.eos_id(), seq_len)?;
    if let Some(id) = blocks
        .iter()
        .flat_map(|b| b.input_ids.iter())
        .copied()
        .find(|&id| id as usize >= model_config.vocab_size)
    {
        return Err(Error::Tokenizer(format!(
            "token id {id} exceeds the model vocabulary of {}",
            model_config.vocab_size
        )));
    }
    tracing::info!(
        records = records.len(),
        blocks = blocks.len(),
        seq_len,
        "packed training data"
    );
    let collator = CausalLmCollator::new(tokenizer.pad_id());

    let outputs = run_workers(world_size, |replica| {
        let mut model = CausalLm::from_store(&model_config, &store)?;
        // Same seed on every replica so adapters start identical
        model.apply_lora(&lora_config, args.seed);
        if replica.is_main_process() {
            model.print_trainable_parameters();
        }

        let mut trainer = Trainer::new(model, args.clone(), &blocks, collator, replica)?
            .with_base_model(spec.model.id.clone());
        trainer.add_callback(NanGuard::new());
        if let Some(patience) = spec.training.early_stopping_patience {
            trainer.add_callback(EarlyStopping::new(patience, 0.0));
        }
        let output = trainer.train()?;
        trainer.save_final()?;
        Ok(output)
    })?;

    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidParameter("no replica produced a result".to_string()))?;

    Ok(TrainSummary {
        steps: output.global_step,
        epochs: args.num_train_epochs,
        final_loss: output.final_loss,
        train_loss: output.train_loss,
        elapsed_secs: output.elapsed_secs,
        output_dir: args.output_dir,
        num_blocks: blocks.len(),
        stopped_early: output.stopped_early,
    })
}

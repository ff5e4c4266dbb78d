//! Supervised fine-tuning loop for one model replica

use super::callback::{CallbackAction, CallbackContext, CallbackManager, TrainerCallback};
use super::loss::{causal_lm_loss, mean};
use super::state::{LogEntry, TrainerState};
use super::TrainingArguments;
use crate::autograd::{backward, Context};
use crate::data::{Batch, CausalLmCollator, DistributedSampler, PackedExample};
use crate::distributed::{Collective, Reduced};
use crate::model::CausalLm;
use crate::optim::{clip_grad_norm, AdamW, LRScheduler, LinearSchedule, Optimizer};
use crate::{Error, Result};
use ndarray::Array1;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Result of a training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Mean of all step losses
    pub train_loss: f32,
    /// Mean loss of the last optimizer step
    pub final_loss: f32,
    /// Whether training stopped before the planned number of steps
    pub stopped_early: bool,
    /// Total training time in seconds
    pub elapsed_secs: f64,
}

/// Trainer for a LoRA-adapted causal LM
///
/// Each micro-batch is run forward and backward with the loss divided by the
/// accumulation steps. At an accumulation boundary (or the last micro-batch of
/// an epoch) gradients are averaged across replicas, clipped, and applied.
/// Only the main replica logs, runs callbacks and writes files.
pub struct Trainer<'a> {
    model: CausalLm,
    args: TrainingArguments,
    optimizer: AdamW,
    scheduler: LinearSchedule,
    collator: CausalLmCollator,
    sampler: DistributedSampler,
    dataset: &'a [PackedExample],
    collective: &'a dyn Collective,
    callbacks: CallbackManager,
    state: TrainerState,
    ctx: Context,
    base_model: Option<String>,
    start_time: Option<Instant>,
}

impl<'a> Trainer<'a> {
    /// Create a trainer over this replica's shard of `dataset`
    ///
    /// The model must already carry LoRA adapters.
    pub fn new(
        model: CausalLm,
        args: TrainingArguments,
        dataset: &'a [PackedExample],
        collator: CausalLmCollator,
        collective: &'a dyn Collective,
    ) -> Result<Self> {
        args.validate()?;
        if model.num_trainable() == 0 {
            return Err(Error::ConfigError(
                "model has no trainable parameters; apply LoRA first".to_string(),
            ));
        }
        if dataset.is_empty() {
            return Err(Error::Dataset("training dataset is empty".to_string()));
        }

        let rank = collective.rank();
        let sampler = DistributedSampler::new(dataset.len(), collective.world_size(), rank, args.seed);
        let num_batches = sampler
            .num_samples()
            .div_ceil(args.per_device_train_batch_size);
        let steps_per_epoch = args.steps_per_epoch(num_batches);
        let max_steps = steps_per_epoch * args.num_train_epochs;

        let optimizer = AdamW::default_params(args.learning_rate, args.weight_decay);
        let scheduler = LinearSchedule::new(args.learning_rate, args.warmup_steps, max_steps);
        let state = TrainerState {
            max_steps,
            num_train_epochs: args.num_train_epochs,
            logging_steps: args.logging_steps,
            save_steps: args.save_steps,
            train_batch_size: args.per_device_train_batch_size,
            ..TrainerState::default()
        };
        // Dropout masks differ per replica
        let ctx = Context::new(args.seed.wrapping_add(rank as u64));

        Ok(Self {
            model,
            args,
            optimizer,
            scheduler,
            collator,
            sampler,
            dataset,
            collective,
            callbacks: CallbackManager::new(),
            state,
            ctx,
            base_model: None,
            start_time: None,
        })
    }

    /// Record the base model id in saved adapter configs
    pub fn with_base_model(mut self, model_id: impl Into<String>) -> Self {
        self.base_model = Some(model_id.into());
        self
    }

    /// Add a callback to the trainer
    pub fn add_callback<C: TrainerCallback + 'static>(&mut self, callback: C) {
        self.callbacks.add(callback);
    }

    pub fn is_main_process(&self) -> bool {
        self.collective.is_main_process()
    }

    pub fn max_steps(&self) -> usize {
        self.state.max_steps
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &CausalLm {
        &self.model
    }

    pub fn into_model(self) -> CausalLm {
        self.model
    }

    /// Get current learning rate
    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    fn elapsed_secs(&self) -> f64 {
        self.start_time.map_or(0.0, |t| t.elapsed().as_secs_f64())
    }

    fn build_context(&self, epoch: usize, loss: f32) -> CallbackContext {
        CallbackContext {
            epoch,
            max_epochs: self.args.num_train_epochs,
            global_step: self.state.global_step,
            max_steps: self.state.max_steps,
            loss,
            lr: self.lr(),
            elapsed_secs: self.elapsed_secs(),
        }
    }

    /// Run training to completion
    ///
    /// On failure the collective is aborted so that peer replicas stop.
    pub fn train(&mut self) -> Result<TrainOutput> {
        let result = self.train_loop();
        if result.is_err() {
            self.collective.abort();
        }
        result
    }

    fn train_loop(&mut self) -> Result<TrainOutput> {
        self.start_time = Some(Instant::now());
        let main = self.is_main_process();
        let accum = self.args.gradient_accumulation_steps;

        if main {
            tracing::info!(
                num_examples = self.dataset.len(),
                num_epochs = self.args.num_train_epochs,
                batch_size_per_replica = self.args.per_device_train_batch_size,
                world_size = self.collective.world_size(),
                gradient_accumulation_steps = accum,
                total_optimization_steps = self.state.max_steps,
                trainable_parameters = self.model.num_trainable(),
                "***** Running training *****"
            );
        }

        let ctx = self.build_context(0, 0.0);
        let mut stop_vote = main && self.callbacks.on_train_begin(&ctx) == CallbackAction::Stop;
        let mut stopped_early = false;
        let mut step_losses: Vec<f32> = Vec::new();
        let mut losses_since_log: Vec<f32> = Vec::new();

        'epochs: for epoch in 0..self.args.num_train_epochs {
            let ctx = self.build_context(epoch, 0.0);
            if main && self.callbacks.on_epoch_begin(&ctx) == CallbackAction::Stop {
                stop_vote = true;
            }

            let batches = self
                .sampler
                .batches(epoch, self.args.per_device_train_batch_size);
            let num_batches = batches.len();
            let mut micro_losses = Vec::with_capacity(accum);

            for (i, indices) in batches.iter().enumerate() {
                let examples: Vec<&PackedExample> = indices.iter().map(|&j| &self.dataset[j]).collect();
                let batch = self.collator.collate(&examples);
                micro_losses.push(self.accumulate_gradients(&batch, accum)?);

                let is_boundary = (i + 1) % accum == 0 || i + 1 == num_batches;
                if !is_boundary {
                    continue;
                }

                let step_loss = mean(&micro_losses);
                micro_losses.clear();
                let reduced = self.sync_gradients(step_loss, stop_vote);
                if reduced.stop {
                    stopped_early = true;
                    break 'epochs;
                }

                self.optimizer_step(reduced.grads);
                self.state.global_step += 1;
                self.state.epoch = epoch as f32 + (i + 1) as f32 / num_batches as f32;
                step_losses.push(reduced.loss);
                losses_since_log.push(reduced.loss);

                if !main {
                    continue;
                }
                let ctx = self.build_context(epoch, reduced.loss);
                if self.callbacks.on_step_end(&ctx) == CallbackAction::Stop {
                    stop_vote = true;
                }
                if self.state.global_step % self.args.logging_steps == 0 {
                    let loss = mean(&losses_since_log);
                    losses_since_log.clear();
                    if self.log(epoch, loss) == CallbackAction::Stop {
                        stop_vote = true;
                    }
                }
                if self.args.save_steps > 0 && self.state.global_step % self.args.save_steps == 0 {
                    self.save_checkpoint(epoch)?;
                }
            }

            let ctx = self.build_context(epoch, step_losses.last().copied().unwrap_or(0.0));
            if main && self.callbacks.on_epoch_end(&ctx) == CallbackAction::Stop {
                stop_vote = true;
            }
        }

        let output = TrainOutput {
            global_step: self.state.global_step,
            train_loss: mean(&step_losses),
            final_loss: step_losses.last().copied().unwrap_or(0.0),
            stopped_early,
            elapsed_secs: self.elapsed_secs(),
        };

        if main {
            self.state.log_history.push(LogEntry {
                step: output.global_step,
                epoch: self.state.epoch,
                loss: None,
                learning_rate: None,
                train_loss: Some(output.train_loss),
                train_runtime: Some(output.elapsed_secs),
            });
            tracing::info!(
                train_loss = output.train_loss,
                train_runtime = output.elapsed_secs,
                global_step = output.global_step,
                stopped_early,
                "training finished"
            );
            let ctx = self.build_context(self.args.num_train_epochs, output.final_loss);
            self.callbacks.on_train_end(&ctx);
        }

        Ok(output)
    }

    /// Forward and backward one micro-batch, returning its unscaled loss
    fn accumulate_gradients(&mut self, batch: &Batch, accum: usize) -> Result<f32> {
        let vocab = self.model.config().vocab_size;
        let logits = self
            .model
            .forward(&batch.input_ids, batch.batch_size, batch.seq_len, &mut self.ctx)?;
        let (loss, num_targets) = causal_lm_loss(&logits, &batch.labels, batch.batch_size, batch.seq_len, vocab);
        let value = loss.data()[0];

        if num_targets > 0 {
            backward(&loss, Some(Array1::from_elem(1, 1.0 / accum as f32)));
        }
        Ok(value)
    }

    /// Mean gradients and step loss across replicas
    fn sync_gradients(&self, step_loss: f32, stop_vote: bool) -> Reduced {
        let grads = self
            .model
            .trainable_parameters()
            .iter()
            .map(|p| p.grad().unwrap_or_else(|| Array1::zeros(p.len())))
            .collect();
        self.collective.all_reduce(grads, step_loss, stop_vote)
    }

    /// Install the reduced gradients, clip, update and advance the schedule
    fn optimizer_step(&mut self, grads: Vec<Array1<f32>>) {
        let params = self.model.trainable_parameters();
        for (param, grad) in params.iter().zip(grads) {
            param.set_grad(grad);
        }
        if self.args.max_grad_norm > 0.0 {
            clip_grad_norm(&params, self.args.max_grad_norm);
        }

        self.scheduler.apply(&mut self.optimizer);
        let mut params = self.model.trainable_parameters_mut();
        self.optimizer.step(&mut params);
        self.optimizer.zero_grad(&mut params);
        self.scheduler.step();
    }

    fn log(&mut self, epoch: usize, loss: f32) -> CallbackAction {
        // Rate for the next step, as schedulers report after stepping
        let learning_rate = self.scheduler.get_lr();
        let entry = LogEntry {
            step: self.state.global_step,
            epoch: self.state.epoch,
            loss: Some(loss),
            learning_rate: Some(learning_rate),
            train_loss: None,
            train_runtime: None,
        };
        tracing::info!(
            step = entry.step,
            loss = loss,
            learning_rate = learning_rate,
            epoch = format_args!("{:.2}", entry.epoch),
            "train"
        );
        self.state.log_history.push(entry);
        let ctx = self.build_context(epoch, loss);
        self.callbacks.on_log(&ctx)
    }

    fn save_checkpoint(&mut self, epoch: usize) -> Result<()> {
        let dir = self
            .args
            .output_dir
            .join(format!("checkpoint-{}", self.state.global_step));
        self.save_model(&dir)?;
        tracing::info!(dir = %dir.display(), "saved checkpoint");
        let ctx = self.build_context(epoch, self.state.last_loss().unwrap_or(0.0));
        self.callbacks.on_save(&ctx, &dir);
        Ok(())
    }

    /// Write the adapter and `trainer_state.json` to `dir`
    pub fn save_model(&self, dir: &Path) -> Result<()> {
        self.model.save_adapter(dir, self.base_model.as_deref())?;
        self.state.save(dir)
    }

    /// Write the final adapter to the output directory (main replica only)
    pub fn save_final(&self) -> Result<Option<PathBuf>> {
        if !self.is_main_process() {
            return Ok(None);
        }
        let dir = self.args.output_dir.clone();
        self.save_model(&dir)?;
        tracing::info!(dir = %dir.display(), "saved adapter");
        Ok(Some(dir))
    }
}

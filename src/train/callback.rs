//! Callback system for training events
//!
//! Provides extensible hooks for training loop events:
//! - `on_train_begin` / `on_train_end`
//! - `on_epoch_begin` / `on_epoch_end`
//! - `on_step_end` after every optimizer step
//! - `on_log` / `on_save` when the trainer logs or writes a checkpoint
//!
//! Callbacks run on the main replica only. A `Stop` is voted into the next
//! gradient all-reduce so every replica stops at the same step.
//!
//! # Example
//!
//! ```rust
//! use afinar::train::callback::{TrainerCallback, CallbackContext, CallbackAction};
//!
//! struct PrintCallback;
//!
//! impl TrainerCallback for PrintCallback {
//!     fn on_log(&mut self, ctx: &CallbackContext) -> CallbackAction {
//!         println!("step {} loss {:.4}", ctx.global_step, ctx.loss);
//!         CallbackAction::Continue
//!     }
//! }
//! ```

use std::path::Path;

/// Context passed to callbacks with current training state
#[derive(Clone, Debug, Default)]
pub struct CallbackContext {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    /// Total epochs planned
    pub max_epochs: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// Optimizer steps planned
    pub max_steps: usize,
    /// Most recent loss (step loss, or the logged mean in `on_log`)
    pub loss: f32,
    /// Current learning rate
    pub lr: f32,
    /// Training duration in seconds
    pub elapsed_secs: f64,
}

/// Action to take after a callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Continue training normally
    Continue,
    /// Stop training
    Stop,
}

/// Trait for training callbacks
///
/// All methods have default no-op implementations, so you only need to
/// implement the events you care about.
pub trait TrainerCallback: Send {
    /// Called before training starts
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called after training ends
    fn on_train_end(&mut self, _ctx: &CallbackContext) {}

    /// Called before each epoch
    fn on_epoch_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called after each epoch
    fn on_epoch_end(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called after each optimizer step
    fn on_step_end(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called every `logging_steps` with the mean loss since the last log
    fn on_log(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called after a checkpoint directory is written
    fn on_save(&mut self, _ctx: &CallbackContext, _dir: &Path) {}

    /// Get callback name for logging
    fn name(&self) -> &str {
        "TrainerCallback"
    }
}

// =============================================================================
// Early Stopping Callback
// =============================================================================

/// Stop training when the logged loss plateaus
///
/// Stops after `patience` consecutive logs without an improvement of at
/// least `min_delta`.
///
/// # Example
///
/// ```rust
/// use afinar::train::callback::EarlyStopping;
///
/// // Stop if no improvement for 5 logs, min improvement 0.001
/// let early_stop = EarlyStopping::new(5, 0.001);
/// ```
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    /// Number of logs to wait for improvement
    patience: usize,
    /// Minimum improvement to reset patience
    min_delta: f32,
    /// Best loss seen so far
    best_loss: f32,
    /// Logs without improvement
    logs_without_improvement: usize,
}

impl EarlyStopping {
    /// Create new early stopping callback
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f32::INFINITY,
            logs_without_improvement: 0,
        }
    }

    /// Reset internal state
    pub fn reset(&mut self) {
        self.best_loss = f32::INFINITY;
        self.logs_without_improvement = 0;
    }

    /// Check if loss improved
    fn check_improvement(&mut self, loss: f32) -> bool {
        if loss < self.best_loss - self.min_delta {
            self.best_loss = loss;
            self.logs_without_improvement = 0;
            true
        } else {
            self.logs_without_improvement += 1;
            false
        }
    }
}

impl TrainerCallback for EarlyStopping {
    fn on_log(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.check_improvement(ctx.loss);

        if self.logs_without_improvement >= self.patience {
            tracing::info!(
                patience = self.patience,
                best_loss = self.best_loss,
                "early stopping: loss stopped improving"
            );
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }

    fn name(&self) -> &str {
        "EarlyStopping"
    }
}

// =============================================================================
// Non-finite loss guard
// =============================================================================

/// Stop training as soon as a step loss is NaN or infinite
#[derive(Clone, Debug, Default)]
pub struct NanGuard {
    tripped_at: Option<usize>,
}

impl NanGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step at which a non-finite loss was seen
    pub fn tripped_at(&self) -> Option<usize> {
        self.tripped_at
    }
}

impl TrainerCallback for NanGuard {
    fn on_step_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        if ctx.loss.is_finite() {
            return CallbackAction::Continue;
        }
        tracing::warn!(step = ctx.global_step, loss = ctx.loss, "non-finite loss, stopping");
        self.tripped_at = Some(ctx.global_step);
        CallbackAction::Stop
    }

    fn name(&self) -> &str {
        "NanGuard"
    }
}

// =============================================================================
// Callback Manager
// =============================================================================

/// Manages multiple callbacks and dispatches events
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainerCallback>>,
}

impl CallbackManager {
    /// Create new callback manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback
    pub fn add<C: TrainerCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    /// Check if no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Get number of callbacks
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Fire an event on every callback; `Stop` wins but all callbacks run
    fn dispatch(&mut self, mut event: impl FnMut(&mut dyn TrainerCallback) -> CallbackAction) -> CallbackAction {
        let mut action = CallbackAction::Continue;
        for cb in &mut self.callbacks {
            if event(cb.as_mut()) == CallbackAction::Stop {
                tracing::debug!(callback = cb.name(), "callback requested stop");
                action = CallbackAction::Stop;
            }
        }
        action
    }

    /// Fire train begin event
    pub fn on_train_begin(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.dispatch(|cb| cb.on_train_begin(ctx))
    }

    /// Fire train end event
    pub fn on_train_end(&mut self, ctx: &CallbackContext) {
        for cb in &mut self.callbacks {
            cb.on_train_end(ctx);
        }
    }

    /// Fire epoch begin event
    pub fn on_epoch_begin(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.dispatch(|cb| cb.on_epoch_begin(ctx))
    }

    /// Fire epoch end event
    pub fn on_epoch_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.dispatch(|cb| cb.on_epoch_end(ctx))
    }

    /// Fire step end event
    pub fn on_step_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.dispatch(|cb| cb.on_step_end(ctx))
    }

    /// Fire log event
    pub fn on_log(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.dispatch(|cb| cb.on_log(ctx))
    }

    /// Fire save event
    pub fn on_save(&mut self, ctx: &CallbackContext, dir: &Path) {
        for cb in &mut self.callbacks {
            cb.on_save(ctx, dir);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Supervised fine-tuning
//!
//! - [`TrainingArguments`]: run hyperparameters
//! - [`causal_lm_loss`]: shifted next-token cross entropy
//! - [`Trainer`]: accumulation, replica all-reduce, logging and checkpoints
//! - [`callback`]: hooks into training events
//! - [`TrainerState`]: the `trainer_state.json` written with every adapter

mod args;
pub mod callback;
mod loss;
mod state;
mod trainer;

pub use args::TrainingArguments;
pub use callback::{CallbackAction, CallbackContext, CallbackManager, EarlyStopping, NanGuard, TrainerCallback};
pub use loss::causal_lm_loss;
pub use state::{LogEntry, TrainerState, TRAINER_STATE_FILE};
pub use trainer::{TrainOutput, Trainer};

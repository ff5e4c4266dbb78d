//! Instruction data pipeline
//!
//! Dolly records flow through formatting, tokenization, packing, sampling
//! and collation before reaching the trainer.

mod collator;
mod dataset;
mod packing;
mod prompt;
mod sampler;

pub use collator::{Batch, CausalLmCollator, IGNORE_INDEX};
pub use dataset::{format_dataset, load_records, DollyRecord, TextSample, DOLLY_DATASET_ID, DOLLY_FILE};
pub use packing::{pack_sequences, PackedExample};
pub use prompt::format_dolly;
pub use sampler::DistributedSampler;

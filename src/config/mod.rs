//! Declarative configuration
//!
//! A run is described by a [`FinetuneSpec`], read from YAML and then
//! overridden by command-line flags.
//!
//! # Example
//!
//! ```yaml
//! model:
//!   id: facebook/opt-125m
//!
//! data:
//!   dataset: databricks/databricks-dolly-15k
//!   max_seq_length: 1024
//!
//! lora:
//!   rank: 16
//!   alpha: 32
//!   dropout: 0.05
//!   target_modules: [q_proj, v_proj]
//!
//! training:
//!   num_epochs: 3
//!   train_batch_size: 16
//!   lr: 3.0e-4
//!
//! distributed:
//!   num_cores: 8
//! ```

mod cli;
mod schema;
mod validate;

pub use cli::{apply_overrides, parse_args, Cli};
pub use schema::{DataSpec, DistributedSpec, FinetuneSpec, LoRASpec, ModelSpec, TrainingSpec};
pub use validate::{validate_config, ValidationError};

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Load and validate a YAML configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FinetuneSpec> {
    let path = path.as_ref();
    let yaml_content = fs::read_to_string(path).map_err(|e| {
        Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    let spec: FinetuneSpec = serde_yaml::from_str(&yaml_content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))?;

    validate_config(&spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;
    Ok(spec)
}

/// Build the effective configuration: defaults, then YAML, then flags
pub fn resolve(cli: &Cli) -> Result<FinetuneSpec> {
    let mut spec = match &cli.config {
        Some(path) => load_config(path)?,
        None => FinetuneSpec::default(),
    };
    apply_overrides(&mut spec, cli);
    validate_config(&spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;
    Ok(spec)
}

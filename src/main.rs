//! afinar CLI
//!
//! Fine-tunes a causal language model on Dolly-15k with LoRA.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: facebook/opt-125m, 8 replicas, 3 epochs
//! afinar
//!
//! # Override from the command line
//! afinar --model_id facebook/opt-125m --num_cores 4 --num_epochs 1 --lr 1e-4
//!
//! # Start from a YAML file, flags win over its values
//! afinar --config finetune.yaml --train_batch_size 8
//!
//! # Validate and print the effective configuration
//! afinar --config finetune.yaml --dry_run
//! ```

use afinar::config::{resolve, Cli, FinetuneSpec};
use afinar::train_model;
use clap::Parser;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise `-v` selects debug and `-q` warnings only
fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::WARN
    } else if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();
}

fn run(cli: &Cli) -> afinar::Result<()> {
    let spec = resolve(cli)?;

    if cli.dry_run {
        print_plan(&spec)?;
        return Ok(());
    }

    let summary = train_model(&spec)?;
    tracing::info!(
        steps = summary.steps,
        epochs = summary.epochs,
        train_loss = summary.train_loss,
        final_loss = summary.final_loss,
        elapsed_secs = summary.elapsed_secs,
        output_dir = %summary.output_dir.display(),
        "training complete"
    );
    if summary.stopped_early {
        tracing::warn!("training stopped before the planned number of steps");
    }
    Ok(())
}

fn print_plan(spec: &FinetuneSpec) -> afinar::Result<()> {
    let yaml = serde_yaml::to_string(spec)
        .map_err(|e| afinar::Error::Serialization(e.to_string()))?;
    println!("Dry run - config validated successfully");
    println!();
    print!("{yaml}");
    println!();
    println!(
        "Effective learning rate: {} ({} x {} replicas)",
        spec.scaled_lr(),
        spec.training.lr,
        spec.distributed.num_cores
    );
    println!(
        "Global batch size: {} ({} per replica x {} accumulation x {} replicas)",
        spec.training.train_batch_size
            * spec.training.gradient_accumulation_steps
            * spec.distributed.num_cores,
        spec.training.train_batch_size,
        spec.training.gradient_accumulation_steps,
        spec.distributed.num_cores
    );
    Ok(())
}

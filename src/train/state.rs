//! Persistent trainer state (`trainer_state.json`)

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// State file name inside checkpoint and output directories
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// One `log_history` entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    /// Fractional epoch
    pub epoch: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_loss: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_runtime: Option<f64>,
}

/// Progress of a run, written next to every saved adapter
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f32,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub train_batch_size: usize,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(TRAINER_STATE_FILE), json)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(dir.join(TRAINER_STATE_FILE))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Most recent logged training loss
    pub fn last_loss(&self) -> Option<f32> {
        self.log_history.iter().rev().find_map(|e| e.loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let state = TrainerState {
            global_step: 20,
            epoch: 1.5,
            max_steps: 40,
            log_history: vec![
                LogEntry {
                    step: 10,
                    epoch: 0.75,
                    loss: Some(2.5),
                    learning_rate: Some(1e-4),
                    train_loss: None,
                    train_runtime: None,
                },
                LogEntry {
                    step: 20,
                    epoch: 1.5,
                    loss: Some(2.0),
                    learning_rate: Some(5e-5),
                    train_loss: None,
                    train_runtime: None,
                },
            ],
            ..Default::default()
        };

        state.save(dir.path()).unwrap();
        let loaded = TrainerState::load(dir.path()).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_loss(), Some(2.0));

        let raw = std::fs::read_to_string(dir.path().join(TRAINER_STATE_FILE)).unwrap();
        assert!(!raw.contains("train_runtime"));
    }
}

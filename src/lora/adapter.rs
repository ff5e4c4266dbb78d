//! PEFT-compatible adapter files
//!
//! An adapter directory holds `adapter_config.json` and
//! `adapter_model.safetensors` with tensors named
//! `base_model.model.{module path}.lora_A.weight` (`[r, d_in]`) and
//! `base_model.model.{module path}.lora_B.weight` (`[d_out, r]`), the layout
//! the Python PEFT library loads.

use super::{LoRAConfig, LoRALinear};
use crate::model::{write_safetensors, WeightStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Adapter weight file name
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Adapter configuration file name
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// `adapter_config.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftAdapterConfig {
    /// PEFT method type (always "LORA")
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f32,
    pub target_modules: Vec<String>,
    pub lora_dropout: f32,
    /// Bias handling: "none", "all", or "lora_only"
    pub bias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_model_name_or_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers_to_transform: Option<Vec<usize>>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub inference_mode: bool,
}

impl PeftAdapterConfig {
    pub fn from_lora_config(config: &LoRAConfig, base_model: Option<&str>) -> Self {
        let target_modules = if config.all_linear {
            super::LINEAR_MODULES.iter().map(|m| m.to_string()).collect()
        } else {
            config.target_modules.iter().cloned().collect()
        };

        Self {
            peft_type: "LORA".to_string(),
            r: config.rank,
            lora_alpha: config.alpha,
            target_modules,
            lora_dropout: config.dropout,
            bias: "none".to_string(),
            base_model_name_or_path: base_model.map(String::from),
            task_type: Some("CAUSAL_LM".to_string()),
            layers_to_transform: config.layers.clone(),
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }

    pub fn to_lora_config(&self) -> LoRAConfig {
        let modules: Vec<&str> = self.target_modules.iter().map(String::as_str).collect();
        let config = LoRAConfig::new(self.r, self.lora_alpha)
            .with_dropout(self.lora_dropout)
            .target_modules(&modules);
        match &self.layers_to_transform {
            Some(layers) => config.target_layers(layers),
            None => config,
        }
    }
}

fn tensor_names(path: &str) -> (String, String) {
    (
        format!("base_model.model.{path}.lora_A.weight"),
        format!("base_model.model.{path}.lora_B.weight"),
    )
}

/// Write the adapters of `layers` (module path, layer) to `output_dir`
pub fn save_adapter(
    output_dir: &Path,
    config: &LoRAConfig,
    base_model: Option<&str>,
    layers: &[(String, &LoRALinear)],
) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;

    let peft_config = PeftAdapterConfig::from_lora_config(config, base_model);
    let config_json = serde_json::to_string_pretty(&peft_config)?;
    std::fs::write(output_dir.join(ADAPTER_CONFIG_FILE), config_json)?;

    let mut tensors = Vec::with_capacity(layers.len() * 2);
    for (path, layer) in layers {
        let (a_name, b_name) = tensor_names(path);
        tensors.push((a_name, vec![layer.rank(), layer.d_in()], layer.lora_a().data().to_vec()));
        tensors.push((b_name, vec![layer.d_out(), layer.rank()], layer.lora_b().data().to_vec()));
    }

    let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
    write_safetensors(&output_dir.join(ADAPTER_WEIGHTS_FILE), &tensors, metadata)?;

    tracing::debug!(dir = %output_dir.display(), modules = layers.len(), "saved adapter");
    Ok(())
}

/// Restore A and B of `layers` from an adapter directory
///
/// Every layer must be present with matching rank and dimensions.
pub fn load_adapter(input_dir: &Path, layers: Vec<(String, &mut LoRALinear)>) -> Result<PeftAdapterConfig> {
    let config_json = std::fs::read_to_string(input_dir.join(ADAPTER_CONFIG_FILE))?;
    let peft_config: PeftAdapterConfig = serde_json::from_str(&config_json)?;
    if peft_config.peft_type != "LORA" {
        return Err(Error::ConfigError(format!(
            "Unsupported adapter type {}",
            peft_config.peft_type
        )));
    }

    let store = WeightStore::load(&input_dir.join(ADAPTER_WEIGHTS_FILE))?;
    for (path, layer) in layers {
        let (a_name, b_name) = tensor_names(&path);
        let a = store.get(&a_name, &[layer.rank(), layer.d_in()])?;
        let b = store.get(&b_name, &[layer.d_out(), layer.rank()])?;
        layer.lora_a_mut().data_mut().assign(&*a);
        layer.lora_b_mut().data_mut().assign(&*b);
    }

    Ok(peft_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Linear;
    use crate::Tensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn make_layer(d_out: usize, d_in: usize, rank: usize, seed: u64) -> LoRALinear {
        let base = Linear::new(Tensor::zeros(d_out * d_in, false), None, d_in, d_out);
        LoRALinear::new(base, rank, 2.0 * rank as f32, 0.05, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_peft_config_fields() {
        let config = PeftAdapterConfig::from_lora_config(&LoRAConfig::default(), Some("facebook/opt-125m"));
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(value["peft_type"], "LORA");
        assert_eq!(value["r"], 16);
        assert_eq!(value["lora_alpha"], 32.0);
        assert_eq!(value["target_modules"], serde_json::json!(["q_proj", "v_proj"]));
        assert_eq!(value["bias"], "none");
        assert_eq!(value["task_type"], "CAUSAL_LM");
        assert_eq!(value["base_model_name_or_path"], "facebook/opt-125m");
        assert!(value.get("layers_to_transform").is_none());
        assert_eq!(config.to_lora_config(), LoRAConfig::default());
    }

    #[test]
    fn test_save_writes_peft_names_and_shapes() {
        let dir = TempDir::new().unwrap();
        let layer = make_layer(6, 4, 2, 1);
        let path = "model.decoder.layers.0.self_attn.q_proj".to_string();

        save_adapter(dir.path(), &LoRAConfig::default(), None, &[(path, &layer)]).unwrap();

        let bytes = std::fs::read(dir.path().join(ADAPTER_WEIGHTS_FILE)).unwrap();
        let tensors = safetensors::SafeTensors::deserialize(&bytes).unwrap();
        let a = tensors
            .tensor("base_model.model.model.decoder.layers.0.self_attn.q_proj.lora_A.weight")
            .unwrap();
        let b = tensors
            .tensor("base_model.model.model.decoder.layers.0.self_attn.q_proj.lora_B.weight")
            .unwrap();
        assert_eq!(a.shape(), &[2, 4]);
        assert_eq!(b.shape(), &[6, 2]);
        assert!(dir.path().join(ADAPTER_CONFIG_FILE).exists());
    }

    #[test]
    fn test_load_restores_weights() {
        let dir = TempDir::new().unwrap();
        let mut trained = make_layer(3, 5, 2, 7);
        *trained.lora_b_mut().data_mut() = ndarray::Array1::from_vec(vec![0.5; 6]);
        let path = "model.decoder.layers.1.self_attn.v_proj".to_string();
        save_adapter(dir.path(), &LoRAConfig::default(), None, &[(path.clone(), &trained)]).unwrap();

        let mut fresh = make_layer(3, 5, 2, 99);
        assert_ne!(fresh.lora_a().data(), trained.lora_a().data());

        let config = load_adapter(dir.path(), vec![(path, &mut fresh)]).unwrap();
        assert_eq!(config.r, 16);
        assert_eq!(fresh.lora_a().data(), trained.lora_a().data());
        assert_eq!(fresh.lora_b().data(), trained.lora_b().data());
    }

    #[test]
    fn test_load_rejects_rank_mismatch() {
        let dir = TempDir::new().unwrap();
        let layer = make_layer(3, 5, 2, 7);
        let path = "m".to_string();
        save_adapter(dir.path(), &LoRAConfig::default(), None, &[(path.clone(), &layer)]).unwrap();

        let mut other = make_layer(3, 5, 4, 7);
        let result = load_adapter(dir.path(), vec![(path, &mut other)]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}

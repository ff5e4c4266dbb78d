//! Read-only checkpoint weights shared by all replicas

use crate::{Error, Result};
use half::{bf16, f16};
use ndarray::Array1;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Prefix of causal-LM checkpoints saved from the task wrapper
const WRAPPER_PREFIX: &str = "model.";

#[derive(Debug, Clone)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Arc<Array1<f32>>,
}

/// Named f32 tensors loaded once and handed out as shared buffers
///
/// Names are normalized so that `model.decoder.*` and `decoder.*` resolve to
/// the same entry.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: HashMap<String, StoredTensor>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `.safetensors` file, converting F16 and BF16 to f32
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Serialization(format!("Cannot read weights {}: {e}", path.display()))
        })?;
        let store = Self::from_bytes(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            tensors = store.len(),
            parameters = store.num_parameters(),
            "loaded weights"
        );
        Ok(store)
    }

    /// Parse safetensors bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let mut store = Self::new();
        for (name, view) in tensors.tensors() {
            let values = to_f32(&name, view.dtype(), view.data())?;
            store.insert(&name, view.shape().to_vec(), values)?;
        }
        Ok(store)
    }

    /// Add a tensor, checking that its length matches `shape`
    pub fn insert(&mut self, name: &str, shape: Vec<usize>, values: Vec<f32>) -> Result<()> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: shape,
                got: vec![values.len()],
            });
        }
        self.tensors.insert(
            normalize(name).to_string(),
            StoredTensor {
                shape,
                data: Arc::new(Array1::from(values)),
            },
        );
        Ok(())
    }

    /// Shared buffer of `name`, which must have exactly `shape`
    pub fn get(&self, name: &str, shape: &[usize]) -> Result<Arc<Array1<f32>>> {
        let tensor = self
            .tensors
            .get(normalize(name))
            .ok_or_else(|| Error::MissingWeight(name.to_string()))?;
        if tensor.shape != shape {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                got: tensor.shape.clone(),
            });
        }
        Ok(Arc::clone(&tensor.data))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(normalize(name))
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar values
    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(|t| t.data.len()).sum()
    }
}

fn normalize(name: &str) -> &str {
    name.strip_prefix(WRAPPER_PREFIX).unwrap_or(name)
}

fn to_f32(name: &str, dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => {
            return Err(Error::Serialization(format!(
                "Tensor {name} has unsupported dtype {other:?}"
            )))
        }
    };
    Ok(values)
}

/// Write f32 tensors to a `.safetensors` file
pub fn write_safetensors(
    path: &Path,
    tensors: &[(String, Vec<usize>, Vec<f32>)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    let views = tensors
        .iter()
        .map(|(name, shape, values)| {
            TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(values.as_slice()))
                .map(|view| (name.as_str(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let bytes = safetensors::serialize(views, Some(metadata))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_and_prefix_normalization() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(
            &path,
            &[(
                "model.decoder.embed_tokens.weight".to_string(),
                vec![2, 3],
                vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            )],
            HashMap::new(),
        )
        .unwrap();

        let store = WeightStore::load(&path).unwrap();
        assert!(store.contains("decoder.embed_tokens.weight"));
        assert!(store.contains("model.decoder.embed_tokens.weight"));
        let data = store.get("decoder.embed_tokens.weight", &[2, 3]).unwrap();
        assert_eq!(data.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(store.num_parameters(), 6);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut store = WeightStore::new();
        store.insert("w", vec![2, 2], vec![0.0; 4]).unwrap();

        let err = store.get("w", &[4, 1]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(matches!(
            store.get("missing", &[1]),
            Err(Error::MissingWeight(_))
        ));
        assert!(store.insert("bad", vec![3], vec![0.0; 2]).is_err());
    }

    #[test]
    fn test_half_precision_conversion() {
        let values = [1.5f32, -2.0, 0.25];
        let f16_bytes: Vec<u8> = values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        let bf16_bytes: Vec<u8> = values
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
            .collect();

        assert_eq!(to_f32("a", Dtype::F16, &f16_bytes).unwrap(), values.to_vec());
        assert_eq!(to_f32("b", Dtype::BF16, &bf16_bytes).unwrap(), values.to_vec());
        assert!(to_f32("c", Dtype::I64, &[0; 8]).is_err());
    }

    #[test]
    fn test_buffers_are_shared() {
        let mut store = WeightStore::new();
        store.insert("w", vec![3], vec![1.0, 2.0, 3.0]).unwrap();

        let a = store.get("w", &[3]).unwrap();
        let b = store.get("w", &[3]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

//! Which decoder projections receive an adapter

use std::collections::BTreeSet;

/// Linear modules of a decoder layer that can carry an adapter
pub const LINEAR_MODULES: [&str; 6] = ["q_proj", "k_proj", "v_proj", "out_proj", "fc1", "fc2"];

/// Target module shorthand selecting every entry of [`LINEAR_MODULES`]
pub const ALL_LINEAR: &str = "all-linear";

/// Adapter hyperparameters and placement
#[derive(Clone, Debug, PartialEq)]
pub struct LoRAConfig {
    /// LoRA rank
    pub rank: usize,
    /// LoRA alpha (scaling parameter)
    pub alpha: f32,
    /// Dropout on the adapter input during training
    pub dropout: f32,
    /// Target module names (e.g., "q_proj", "v_proj")
    pub target_modules: BTreeSet<String>,
    /// Layer indices to apply LoRA to (None = all layers)
    pub layers: Option<Vec<usize>>,
    /// Whether every linear module is targeted
    pub all_linear: bool,
}

impl LoRAConfig {
    /// Configuration with no targets and no dropout
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            dropout: 0.0,
            target_modules: BTreeSet::new(),
            layers: None,
            all_linear: false,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Scaling factor applied to the low-rank update
    pub fn scale(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    /// Target modules by name; [`ALL_LINEAR`] selects every linear module
    pub fn target_modules(mut self, modules: &[&str]) -> Self {
        self.all_linear = modules.contains(&ALL_LINEAR);
        self.target_modules = modules
            .iter()
            .filter(|m| **m != ALL_LINEAR)
            .map(|m| m.to_string())
            .collect();
        self
    }

    /// Query and value projections, the usual choice for causal LMs
    pub fn target_qv_projections(self) -> Self {
        self.target_modules(&["q_proj", "v_proj"])
    }

    /// Restrict adapters to these layer indices
    pub fn target_layers(mut self, layer_indices: &[usize]) -> Self {
        self.layers = Some(layer_indices.to_vec());
        self
    }

    pub fn all_linear_layers(mut self) -> Self {
        self.all_linear = true;
        self
    }

    /// Whether `module_name` in layer `layer_idx` gets an adapter
    ///
    /// A `None` layer index skips the layer filter.
    pub fn should_apply(&self, module_name: &str, layer_idx: Option<usize>) -> bool {
        let layer_selected = match (&self.layers, layer_idx) {
            (Some(layers), Some(idx)) => layers.contains(&idx),
            _ => true,
        };
        if !layer_selected {
            return false;
        }

        if self.all_linear {
            LINEAR_MODULES.contains(&module_name)
        } else {
            self.target_modules.contains(module_name)
        }
    }
}

impl Default for LoRAConfig {
    /// rank 16, alpha 32, dropout 0.05 on q_proj and v_proj
    fn default() -> Self {
        Self::new(16, 32.0)
            .with_dropout(0.05)
            .target_qv_projections()
    }
}

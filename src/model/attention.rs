//! Causal multi-head self-attention

use super::{Linear, ModelConfig, Projection, WeightStore};
use crate::autograd::{causal_attention, scale, AttentionShape, Context};
use crate::{Result, Tensor};

/// Self-attention block with query, key, value and output projections
pub struct SelfAttention {
    pub(crate) q_proj: Projection,
    pub(crate) k_proj: Projection,
    pub(crate) v_proj: Projection,
    pub(crate) out_proj: Projection,
    num_heads: usize,
    head_dim: usize,
    scaling: f32,
}

impl SelfAttention {
    pub fn from_store(store: &WeightStore, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let proj = |name: &str| {
            Linear::from_store(store, &format!("{prefix}.{name}"), hidden, hidden, config.enable_bias)
                .map(Projection::Frozen)
        };
        Ok(Self {
            q_proj: proj("q_proj")?,
            k_proj: proj("k_proj")?,
            v_proj: proj("v_proj")?,
            out_proj: proj("out_proj")?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            scaling: (config.head_dim() as f32).powf(-0.5),
        })
    }

    /// Attend over `batch` sequences of `seq_len` rows each
    pub fn forward(&self, x: &Tensor, batch: usize, seq_len: usize, ctx: &mut Context) -> Tensor {
        let rows = batch * seq_len;

        // Queries are scaled after projection, bias included
        let q = scale(&self.q_proj.forward(x, rows, ctx), self.scaling);
        let k = self.k_proj.forward(x, rows, ctx);
        let v = self.v_proj.forward(x, rows, ctx);

        let shape = AttentionShape {
            batch,
            seq_len,
            num_heads: self.num_heads,
            head_dim: self.head_dim,
        };
        let attn = causal_attention(&q, &k, &v, shape, 1.0);

        self.out_proj.forward(&attn, rows, ctx)
    }

    /// Projections by module name
    pub(crate) fn projections_mut(&mut self) -> [(&'static str, &mut Projection); 4] {
        [
            ("q_proj", &mut self.q_proj),
            ("k_proj", &mut self.k_proj),
            ("v_proj", &mut self.v_proj),
            ("out_proj", &mut self.out_proj),
        ]
    }

    pub(crate) fn projections(&self) -> [(&'static str, &Projection); 4] {
        [
            ("q_proj", &self.q_proj),
            ("k_proj", &self.k_proj),
            ("v_proj", &self.v_proj),
            ("out_proj", &self.out_proj),
        ]
    }
}

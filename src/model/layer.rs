//! Pre-LayerNorm decoder layer

use super::{Activation, Linear, ModelConfig, Projection, SelfAttention, WeightStore};
use crate::autograd::{add, dropout, gelu, layer_norm, relu, Context};
use crate::{Result, Tensor};

/// Learnable LayerNorm parameters (frozen here)
#[derive(Clone)]
pub struct LayerNorm {
    gamma: Tensor,
    beta: Tensor,
    dim: usize,
    eps: f32,
}

impl LayerNorm {
    pub fn from_store(store: &WeightStore, prefix: &str, dim: usize, eps: f32) -> Result<Self> {
        Ok(Self {
            gamma: Tensor::from_shared(store.get(&format!("{prefix}.weight"), &[dim])?, false),
            beta: Tensor::from_shared(store.get(&format!("{prefix}.bias"), &[dim])?, false),
            dim,
            eps,
        })
    }

    pub fn forward(&self, x: &Tensor, rows: usize) -> Tensor {
        layer_norm(x, &self.gamma, &self.beta, rows, self.dim, self.eps)
    }

    pub fn num_parameters(&self) -> usize {
        2 * self.dim
    }
}

/// One decoder layer:
///
/// ```text
/// h = x + dropout(attn(ln1(x)))
/// y = h + dropout(fc2(act(fc1(ln2(h)))))
/// ```
pub struct DecoderLayer {
    self_attn_layer_norm: LayerNorm,
    pub(crate) self_attn: SelfAttention,
    final_layer_norm: LayerNorm,
    pub(crate) fc1: Projection,
    pub(crate) fc2: Projection,
    activation: Activation,
    dropout: f32,
}

impl DecoderLayer {
    pub fn from_store(store: &WeightStore, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn_layer_norm: LayerNorm::from_store(
                store,
                &format!("{prefix}.self_attn_layer_norm"),
                hidden,
                eps,
            )?,
            self_attn: SelfAttention::from_store(store, &format!("{prefix}.self_attn"), config)?,
            final_layer_norm: LayerNorm::from_store(
                store,
                &format!("{prefix}.final_layer_norm"),
                hidden,
                eps,
            )?,
            fc1: Projection::Frozen(Linear::from_store(
                store,
                &format!("{prefix}.fc1"),
                hidden,
                config.ffn_dim,
                config.enable_bias,
            )?),
            fc2: Projection::Frozen(Linear::from_store(
                store,
                &format!("{prefix}.fc2"),
                config.ffn_dim,
                hidden,
                config.enable_bias,
            )?),
            activation: config.activation_function,
            dropout: config.dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, batch: usize, seq_len: usize, ctx: &mut Context) -> Tensor {
        let rows = batch * seq_len;

        let normed = self.self_attn_layer_norm.forward(x, rows);
        let attn = self.self_attn.forward(&normed, batch, seq_len, ctx);
        let h = add(x, &dropout(&attn, self.dropout, ctx));

        let normed = self.final_layer_norm.forward(&h, rows);
        let up = self.fc1.forward(&normed, rows, ctx);
        let act = match self.activation {
            Activation::Relu => relu(&up),
            Activation::Gelu => gelu(&up),
        };
        let down = self.fc2.forward(&act, rows, ctx);
        add(&h, &dropout(&down, self.dropout, ctx))
    }

    /// Every projection of the layer with its module name
    pub(crate) fn projections_mut(&mut self) -> Vec<(&'static str, &mut Projection)> {
        let mut projections: Vec<(&'static str, &mut Projection)> =
            self.self_attn.projections_mut().into_iter().collect();
        projections.push(("fc1", &mut self.fc1));
        projections.push(("fc2", &mut self.fc2));
        projections
    }

    pub(crate) fn projections(&self) -> Vec<(&'static str, &Projection)> {
        let mut projections: Vec<(&'static str, &Projection)> =
            self.self_attn.projections().into_iter().collect();
        projections.push(("fc1", &self.fc1));
        projections.push(("fc2", &self.fc2));
        projections
    }

    pub fn num_parameters(&self) -> usize {
        self.self_attn_layer_norm.num_parameters()
            + self.final_layer_norm.num_parameters()
            + self
                .projections()
                .iter()
                .map(|(_, p)| p.num_parameters())
                .sum::<usize>()
    }
}

//! Frozen linear layers and their adaptable wrapper

use crate::autograd::{add_bias, matmul_nt, Context};
use crate::lora::{LoRAConfig, LoRALinear};
use crate::model::WeightStore;
use crate::{Result, Tensor};
use rand::rngs::StdRng;

/// Linear map `y = x Wᵀ + b` with `W` stored as `[out_features, in_features]`
#[derive(Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>, in_features: usize, out_features: usize) -> Self {
        assert_eq!(weight.len(), in_features * out_features, "weight size must match out x in");
        if let Some(b) = &bias {
            assert_eq!(b.len(), out_features, "bias size must match out_features");
        }
        Self {
            weight,
            bias,
            in_features,
            out_features,
        }
    }

    /// Frozen layer backed by `{prefix}.weight` and optionally `{prefix}.bias`
    pub fn from_store(
        store: &WeightStore,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
    ) -> Result<Self> {
        let weight = store.get(&format!("{prefix}.weight"), &[out_features, in_features])?;
        let bias = if bias {
            let b = store.get(&format!("{prefix}.bias"), &[out_features])?;
            Some(Tensor::from_shared(b, false))
        } else {
            None
        };
        Ok(Self::new(
            Tensor::from_shared(weight, false),
            bias,
            in_features,
            out_features,
        ))
    }

    /// Apply to a `rows x in_features` input
    pub fn forward(&self, x: &Tensor, rows: usize) -> Tensor {
        let y = matmul_nt(x, &self.weight, rows, self.in_features, self.out_features);
        match &self.bias {
            Some(b) => add_bias(&y, b, rows, self.out_features),
            None => y,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Tensor {
        &mut self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, Tensor::len)
    }
}

/// A projection inside a decoder layer, frozen or carrying a LoRA adapter
pub enum Projection {
    Frozen(Linear),
    Adapted(LoRALinear),
}

impl Projection {
    pub fn forward(&self, x: &Tensor, rows: usize, ctx: &mut Context) -> Tensor {
        match self {
            Projection::Frozen(linear) => linear.forward(x, rows),
            Projection::Adapted(lora) => lora.forward(x, rows, ctx),
        }
    }

    /// Wrap the frozen layer with a freshly initialized adapter
    ///
    /// A projection that already carries an adapter is left untouched.
    pub fn adapt(&mut self, config: &LoRAConfig, rng: &mut StdRng) {
        if let Projection::Frozen(linear) = self {
            let lora = LoRALinear::new(linear.clone(), config.rank, config.alpha, config.dropout, rng);
            *self = Projection::Adapted(lora);
        }
    }

    pub fn lora(&self) -> Option<&LoRALinear> {
        match self {
            Projection::Adapted(lora) => Some(lora),
            Projection::Frozen(_) => None,
        }
    }

    pub fn lora_mut(&mut self) -> Option<&mut LoRALinear> {
        match self {
            Projection::Adapted(lora) => Some(lora),
            Projection::Frozen(_) => None,
        }
    }

    /// All parameters, frozen and trainable
    pub fn num_parameters(&self) -> usize {
        match self {
            Projection::Frozen(linear) => linear.num_parameters(),
            Projection::Adapted(lora) => lora.base().num_parameters() + lora.num_trainable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn linear() -> Linear {
        // W = [[1, 2], [3, 4], [5, 6]], b = [0.5, -0.5, 1]
        Linear::new(
            Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], false),
            Some(Tensor::from_vec(vec![0.5, -0.5, 1.0], false)),
            2,
            3,
        )
    }

    #[test]
    fn test_linear_forward() {
        let x = Tensor::from_vec(vec![1.0, 1.0, 0.0, 2.0], false);
        let y = linear().forward(&x, 2);
        assert_eq!(y.data().to_vec(), vec![3.5, 6.5, 12.0, 4.5, 7.5, 13.0]);
    }

    #[test]
    fn test_from_store_shares_buffers() {
        let mut store = WeightStore::new();
        store.insert("p.weight", vec![3, 2], vec![0.0; 6]).unwrap();
        store.insert("p.bias", vec![3], vec![0.0; 3]).unwrap();

        let a = Linear::from_store(&store, "p", 2, 3, true).unwrap();
        let b = Linear::from_store(&store, "p", 2, 3, true).unwrap();
        assert!(std::sync::Arc::ptr_eq(
            &a.weight().shared_data(),
            &b.weight().shared_data()
        ));
        assert!(!a.weight().requires_grad());
        assert!(Linear::from_store(&store, "p", 3, 2, true).is_err());
    }

    #[test]
    fn test_adapted_projection_starts_at_base_output() {
        let config = LoRAConfig::default();
        let mut rng = StdRng::seed_from_u64(0);
        let frozen = Projection::Frozen(linear());
        let mut adapted = Projection::Frozen(linear());
        adapted.adapt(&config, &mut rng);
        assert!(adapted.lora().is_some());

        let mut ctx = Context::new(0);
        ctx.eval();
        let x = Tensor::from_vec(vec![0.3, -1.2], false);
        let base = frozen.forward(&x, 1, &mut ctx);
        let out = adapted.forward(&x, 1, &mut ctx);
        for (a, b) in base.data().iter().zip(out.data().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
        assert_eq!(
            adapted.num_parameters(),
            9 + config.rank * 2 + 3 * config.rank
        );
    }
}

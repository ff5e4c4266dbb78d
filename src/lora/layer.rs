//! LoRA (Low-Rank Adaptation) linear layer
//!
//! LoRA enables parameter-efficient fine-tuning by adding trainable low-rank
//! decomposition matrices to frozen pretrained weights.
//!
//! For a frozen weight matrix W ∈ ℝ^(d_out × d_in), LoRA adds:
//! ΔW = B @ A where A ∈ ℝ^(r × d_in) and B ∈ ℝ^(d_out × r)
//!
//! Forward pass on a batch of rows: y = x Wᵀ + b + s · dropout(x) Aᵀ Bᵀ
//! where s = alpha / r

use crate::autograd::{add, dropout, matmul, matmul_nt, scale, Context};
use crate::model::Linear;
use crate::Tensor;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::Rng;

/// Linear layer with a trainable low-rank update on a frozen base
pub struct LoRALinear {
    /// Frozen base projection
    base: Linear,
    /// LoRA matrix A stored as 1D [r * d_in] - downprojection
    lora_a: Tensor,
    /// LoRA matrix B stored as 1D [d_out * r] - upprojection
    lora_b: Tensor,
    /// LoRA rank
    rank: usize,
    /// Scaling factor (alpha/rank)
    scale: f32,
    /// Dropout applied to the adapter input
    dropout: f32,
    /// Whether the adapter is merged into the base weight
    merged: bool,
}

impl LoRALinear {
    /// Wrap a frozen projection
    ///
    /// A is drawn from a Kaiming-uniform distribution with bound `1/sqrt(d_in)`
    /// and B is zero, so the initial update ΔW = B·A vanishes. Replicas that
    /// share a seed draw identical adapters.
    pub fn new(base: Linear, rank: usize, alpha: f32, dropout: f32, rng: &mut StdRng) -> Self {
        let d_in = base.in_features();
        let d_out = base.out_features();
        let bound = 1.0 / (d_in as f32).sqrt();

        let lora_a_data: Vec<f32> = (0..rank * d_in)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let lora_a = Tensor::from_vec(lora_a_data, true);
        let lora_b = Tensor::zeros(d_out * rank, true);

        Self {
            base,
            lora_a,
            lora_b,
            rank,
            scale: alpha / rank as f32,
            dropout,
            merged: false,
        }
    }

    /// Forward pass on a `rows x d_in` input
    pub fn forward(&self, x: &Tensor, rows: usize, ctx: &mut Context) -> Tensor {
        let base_output = self.base.forward(x, rows);
        if self.merged {
            // W already includes the adaptation
            return base_output;
        }

        let (d_in, d_out) = (self.d_in(), self.d_out());
        let h = dropout(x, self.dropout, ctx);
        // [rows, d_in] @ Aᵀ -> [rows, r]
        let down = matmul_nt(&h, &self.lora_a, rows, d_in, self.rank);
        // [rows, r] @ Bᵀ -> [rows, d_out]
        let up = matmul_nt(&down, &self.lora_b, rows, self.rank, d_out);

        add(&base_output, &scale(&up, self.scale))
    }

    /// scale · (B @ A) as a flat `[d_out * d_in]` buffer
    fn delta_weight(&self) -> Array1<f32> {
        let b = Tensor::from_shared(self.lora_b.shared_data(), false);
        let a = Tensor::from_shared(self.lora_a.shared_data(), false);
        let ba = matmul(&b, &a, self.d_out(), self.rank, self.d_in());
        ba.data() * self.scale
    }

    /// Merge LoRA weights into base weight: W' = W + scale * (B @ A)
    ///
    /// The base buffer is copied before being modified, so replicas sharing
    /// it are unaffected.
    pub fn merge(&mut self) {
        if self.merged {
            return;
        }
        let delta = self.delta_weight();
        *self.base.weight_mut().data_mut() += &delta;
        self.merged = true;
    }

    /// Unmerge LoRA weights from base weight: W = W' - scale * (B @ A)
    pub fn unmerge(&mut self) {
        if !self.merged {
            return;
        }
        let delta = self.delta_weight();
        *self.base.weight_mut().data_mut() -= &delta;
        self.merged = false;
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn lora_a(&self) -> &Tensor {
        &self.lora_a
    }

    pub fn lora_a_mut(&mut self) -> &mut Tensor {
        &mut self.lora_a
    }

    pub fn lora_b(&self) -> &Tensor {
        &self.lora_b
    }

    pub fn lora_b_mut(&mut self) -> &mut Tensor {
        &mut self.lora_b
    }

    /// Get trainable parameters (A and B)
    pub fn trainable_params(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.lora_a, &mut self.lora_b]
    }

    /// Number of trainable values
    pub fn num_trainable(&self) -> usize {
        self.lora_a.len() + self.lora_b.len()
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn d_out(&self) -> usize {
        self.base.out_features()
    }

    pub fn d_in(&self) -> usize {
        self.base.in_features()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn base(d_out: usize, d_in: usize, values: Vec<f32>) -> Linear {
        Linear::new(Tensor::from_vec(values, false), None, d_in, d_out)
    }

    fn layer(d_out: usize, d_in: usize, values: Vec<f32>, rank: usize, alpha: f32) -> LoRALinear {
        let mut rng = StdRng::seed_from_u64(42);
        LoRALinear::new(base(d_out, d_in, values), rank, alpha, 0.0, &mut rng)
    }

    fn eval_ctx() -> Context {
        let mut ctx = Context::new(0);
        ctx.eval();
        ctx
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        #[test]
        fn prop_zero_b_gives_base_output(
            d_out in 2usize..10,
            d_in in 2usize..10,
            rank in 1usize..5,
            rows in 1usize..4,
        ) {
            let base_data: Vec<f32> = (0..d_out * d_in).map(|i| (i as f32 * 0.1).sin()).collect();
            let lora = layer(d_out, d_in, base_data.clone(), rank, 1.0);

            let x_data: Vec<f32> = (0..rows * d_in).map(|i| i as f32 * 0.5).collect();
            let x = Tensor::from_vec(x_data, true);

            let lora_output = lora.forward(&x, rows, &mut eval_ctx());
            let base_output = base(d_out, d_in, base_data).forward(&x, rows);

            for i in 0..rows * d_out {
                prop_assert!(
                    (lora_output.data()[i] - base_output.data()[i]).abs() < 1e-4,
                    "Zero B should give base output at index {}", i
                );
            }
        }

        #[test]
        fn prop_merge_preserves_forward_output(
            d_out in 2usize..8,
            d_in in 2usize..8,
            rank in 1usize..4,
        ) {
            let base_data: Vec<f32> = (0..d_out * d_in).map(|i| (i as f32 * 0.1).cos()).collect();
            let mut lora = layer(d_out, d_in, base_data, rank, 2.0);

            let b_data: Vec<f32> = (0..d_out * rank).map(|i| (i as f32 * 0.3).cos() * 0.1).collect();
            *lora.lora_b_mut().data_mut() = Array1::from_vec(b_data);

            let x = Tensor::from_vec((0..d_in).map(|i| i as f32 + 1.0).collect(), false);
            let output_before = lora.forward(&x, 1, &mut eval_ctx());

            lora.merge();
            prop_assert!(lora.is_merged());
            let output_after = lora.forward(&x, 1, &mut eval_ctx());

            for i in 0..d_out {
                prop_assert!(
                    (output_before.data()[i] - output_after.data()[i]).abs() < 1e-3,
                    "Merge should preserve output at index {}: before={} after={}",
                    i, output_before.data()[i], output_after.data()[i]
                );
            }
        }

        #[test]
        fn prop_unmerge_restores_weights(
            d_out in 2usize..8,
            d_in in 2usize..8,
            rank in 1usize..4,
        ) {
            let base_data: Vec<f32> = (0..d_out * d_in).map(|i| i as f32 * 0.5).collect();
            let mut lora = layer(d_out, d_in, base_data.clone(), rank, 1.0);
            let b_data: Vec<f32> = (0..d_out * rank).map(|i| i as f32 * 0.02).collect();
            *lora.lora_b_mut().data_mut() = Array1::from_vec(b_data);

            lora.merge();
            lora.unmerge();

            for (i, expected) in base_data.iter().enumerate() {
                prop_assert!(
                    (lora.base().weight().data()[i] - expected).abs() < 1e-4,
                    "Unmerge should restore weight at index {}", i
                );
            }
        }

        #[test]
        fn prop_scale_factor_correct(
            rank in 1usize..32,
            alpha in 1.0f32..64.0,
        ) {
            let lora = layer(1, 1, vec![1.0], rank, alpha);
            prop_assert!((lora.scale() - alpha / rank as f32).abs() < 1e-6);
        }

        #[test]
        fn prop_init_bound_respected(
            d_in in 1usize..64,
            rank in 1usize..8,
        ) {
            let lora = layer(2, d_in, vec![0.0; 2 * d_in], rank, 1.0);
            let bound = 1.0 / (d_in as f32).sqrt();
            prop_assert_eq!(lora.lora_a().len(), rank * d_in);
            prop_assert_eq!(lora.lora_b().len(), 2 * rank);
            prop_assert!(lora.lora_a().data().iter().all(|v| v.abs() <= bound));
            prop_assert!(lora.lora_b().data().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_lora_forward_unmerged() {
        // Identity base, A = [1, 2] (1x2), B = [3, 4] (2x1)
        let mut lora = layer(2, 2, vec![1.0, 0.0, 0.0, 1.0], 1, 1.0);
        *lora.lora_a_mut().data_mut() = ndarray::arr1(&[1.0, 2.0]);
        *lora.lora_b_mut().data_mut() = ndarray::arr1(&[3.0, 4.0]);

        let x = Tensor::from_vec(vec![1.0, 2.0], true);
        let output = lora.forward(&x, 1, &mut eval_ctx());

        // Base [1, 2] + B(Ax) = [1, 2] + 5·[3, 4]
        assert_abs_diff_eq!(output.data()[0], 16.0, epsilon = 1e-4);
        assert_abs_diff_eq!(output.data()[1], 22.0, epsilon = 1e-4);
    }

    #[test]
    fn test_lora_merge_unmerge() {
        let mut lora = layer(2, 2, vec![1.0, 0.0, 0.0, 1.0], 1, 1.0);
        *lora.lora_a_mut().data_mut() = ndarray::arr1(&[1.0, 2.0]);
        *lora.lora_b_mut().data_mut() = ndarray::arr1(&[0.5, 0.5]);
        let original_weight = lora.base().weight().data().to_owned();

        lora.merge();
        assert!(lora.is_merged());

        // B @ A = [[0.5, 1.0], [0.5, 1.0]]
        let merged = lora.base().weight().data().to_vec();
        assert_eq!(merged, vec![1.5, 1.0, 0.5, 2.0]);

        lora.unmerge();
        assert!(!lora.is_merged());
        for (r, o) in lora.base().weight().data().iter().zip(original_weight.iter()) {
            assert_abs_diff_eq!(r, o, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_merge_does_not_touch_shared_buffer() {
        let shared = std::sync::Arc::new(ndarray::arr1(&[1.0_f32, 0.0, 0.0, 1.0]));
        let linear = Linear::new(Tensor::from_shared(shared.clone(), false), None, 2, 2);
        let mut lora = LoRALinear::new(linear, 1, 1.0, 0.0, &mut StdRng::seed_from_u64(1));
        *lora.lora_b_mut().data_mut() = ndarray::arr1(&[1.0, 1.0]);

        lora.merge();
        assert_eq!(shared.to_vec(), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_gradients_reach_only_adapter() {
        let mut lora = layer(2, 3, vec![0.1; 6], 2, 4.0);
        *lora.lora_b_mut().data_mut() = ndarray::arr1(&[0.5, -0.5, 0.25, 1.0]);

        let x = Tensor::from_vec(vec![1.0, -1.0, 0.5, 2.0, 0.0, 1.0], false);
        let out = lora.forward(&x, 2, &mut eval_ctx());
        backward(&out, None);

        assert!(lora.lora_a().grad().is_some());
        assert!(lora.lora_b().grad().is_some());
        assert!(lora.base().weight().grad().is_none());
    }

    #[test]
    fn test_same_seed_same_init() {
        let a = layer(4, 4, vec![0.0; 16], 2, 1.0);
        let b = layer(4, 4, vec![0.0; 16], 2, 1.0);
        assert_eq!(a.lora_a().data(), b.lora_a().data());
    }

    #[test]
    fn test_lora_trainable_params() {
        let mut lora = layer(2, 2, vec![1.0, 2.0, 3.0, 4.0], 2, 4.0);
        assert_eq!(lora.num_trainable(), 8);

        let params = lora.trainable_params();
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(|p| p.requires_grad()));
    }

    #[test]
    fn test_lora_rank_scaling() {
        let lora_r4 = layer(1, 1, vec![1.0], 4, 8.0);
        let lora_r8 = layer(1, 1, vec![1.0], 8, 8.0);

        assert_abs_diff_eq!(lora_r4.scale(), 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(lora_r8.scale(), 1.0, epsilon = 1e-6);
    }
}

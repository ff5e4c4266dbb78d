//! Global gradient norm clipping

use crate::Tensor;

/// Scale all gradients so their joint L2 norm is at most `max_norm`
///
/// Returns the norm before clipping. Parameters without a gradient are
/// ignored; a non-positive `max_norm` disables clipping.
pub fn clip_grad_norm(params: &[&Tensor], max_norm: f32) -> f32 {
    let total_norm = params
        .iter()
        .filter_map(|p| p.grad())
        .map(|g| g.iter().map(|x| x * x).sum::<f32>())
        .sum::<f32>()
        .sqrt();

    if max_norm > 0.0 && total_norm > max_norm {
        let coef = max_norm / (total_norm + 1e-6);
        for param in params {
            if let Some(grad) = param.grad() {
                param.set_grad(grad * coef);
            }
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_clips_joint_norm() {
        let a = Tensor::from_vec(vec![0.0, 0.0], true);
        let b = Tensor::from_vec(vec![0.0], true);
        a.set_grad(ndarray::arr1(&[3.0, 0.0]));
        b.set_grad(ndarray::arr1(&[4.0]));

        let norm = clip_grad_norm(&[&a, &b], 1.0);

        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-6);
        let a_grad = a.grad().unwrap();
        let b_grad = b.grad().unwrap();
        assert_abs_diff_eq!(a_grad[0], 0.6, epsilon = 1e-5);
        assert_abs_diff_eq!(b_grad[0], 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_small_norm_untouched() {
        let a = Tensor::from_vec(vec![0.0], true);
        a.set_grad(ndarray::arr1(&[0.5]));
        let no_grad = Tensor::from_vec(vec![0.0], true);

        let norm = clip_grad_norm(&[&a, &no_grad], 1.0);

        assert_abs_diff_eq!(norm, 0.5, epsilon = 1e-6);
        assert_eq!(a.grad().unwrap()[0], 0.5);
        assert!(no_grad.grad().is_none());
    }

    proptest! {
        #[test]
        fn prop_clipped_norm_bounded(values in prop::collection::vec(-100.0f32..100.0, 1..32)) {
            let t = Tensor::from_vec(vec![0.0; values.len()], true);
            t.set_grad(ndarray::Array1::from(values));
            clip_grad_norm(&[&t], 1.0);
            let norm = t.grad().unwrap().iter().map(|x| x * x).sum::<f32>().sqrt();
            prop_assert!(norm <= 1.0 + 1e-4);
        }
    }
}

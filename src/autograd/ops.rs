//! Autograd operations with backward passes
//!
//! Matrices are flat row-major buffers. Every function documents the
//! logical shapes it expects; mismatched lengths are programming errors and
//! panic like an out-of-bounds index would.

use super::{BackwardOp, Context, GradCell, Tensor};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use std::rc::Rc;

fn as_matrix(data: &Array1<f32>, rows: usize, cols: usize) -> ArrayView2<'_, f32> {
    assert_eq!(
        data.len(),
        rows * cols,
        "Tensor of length {} cannot be viewed as {rows}x{cols}",
        data.len()
    );
    data.view()
        .into_shape_with_order((rows, cols))
        .expect("contiguous buffer of matching length")
}

fn flatten(matrix: Array2<f32>) -> Array1<f32> {
    matrix.iter().copied().collect()
}

fn finish(data: Array1<f32>, requires_grad: bool, op: impl FnOnce(GradCell) -> Rc<dyn BackwardOp>) -> Tensor {
    let mut result = Tensor::new(data, requires_grad);
    if requires_grad {
        let backward_op = op(result.grad_cell());
        result.set_backward_op(backward_op);
    }
    result
}

/// Add two tensors of equal length
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add requires equal lengths");
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    finish(data, requires_grad, |result_grad| {
        Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad,
        })
    })
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Add a bias vector to every row of a `rows x cols` matrix
pub fn add_bias(x: &Tensor, bias: &Tensor, rows: usize, cols: usize) -> Tensor {
    assert_eq!(bias.len(), cols, "bias length must equal column count");
    let mut out = as_matrix(x.data(), rows, cols).to_owned();
    out += &bias.data().view();
    let requires_grad = x.requires_grad() || bias.requires_grad();

    finish(flatten(out), requires_grad, |result_grad| {
        Rc::new(AddBiasBackward {
            x: x.clone(),
            bias: bias.clone(),
            rows,
            cols,
            result_grad,
        })
    })
}

struct AddBiasBackward {
    x: Tensor,
    bias: Tensor,
    rows: usize,
    cols: usize,
    result_grad: GradCell,
}

impl BackwardOp for AddBiasBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.x.requires_grad() {
                self.x.accumulate_grad(grad.clone());
            }
            if self.bias.requires_grad() {
                // ∂L/∂bias = column sums of ∂L/∂out
                let grad_bias = as_matrix(grad, self.rows, self.cols).sum_axis(Axis(0));
                self.bias.accumulate_grad(grad_bias);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x, &self.bias]
    }
}

/// Scale tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;

    finish(data, a.requires_grad(), |result_grad| {
        Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad,
        })
    })
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: GradCell,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            // ∂L/∂a = ∂L/∂out * factor
            self.a.accumulate_grad(grad * self.factor);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// ReLU activation
pub fn relu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x.max(0.0));

    finish(data, a.requires_grad(), |result_grad| {
        Rc::new(ReluBackward {
            a: a.clone(),
            result_grad,
        })
    })
}

struct ReluBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for ReluBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            // ∂L/∂a = ∂L/∂out * (a > 0)
            let mask = self.a.data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
            self.a.accumulate_grad(grad * &mask);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

/// GELU activation (Gaussian Error Linear Unit)
///
/// GELU(x) ≈ 0.5 * x * (1 + tanh(√(2/π) * (x + 0.044715 * x³)))
pub fn gelu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| {
        let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
        0.5 * x * (1.0 + inner.tanh())
    });

    finish(data, a.requires_grad(), |result_grad| {
        Rc::new(GeluBackward {
            a: a.clone(),
            result_grad,
        })
    })
}

struct GeluBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for GeluBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            // ∂GELU/∂x = 0.5 * (1 + tanh(z)) + 0.5 * x * sech²(z) * dz/dx
            let grad_a: Array1<f32> = self
                .a
                .data()
                .iter()
                .zip(grad_output.iter())
                .map(|(&x, &grad)| {
                    let x2 = x * x;
                    let z = SQRT_2_OVER_PI * (x + GELU_COEFF * x2 * x);
                    let tanh_z = z.tanh();
                    let sech2_z = 1.0 - tanh_z * tanh_z;
                    let dz_dx = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x2);
                    grad * (0.5 * (1.0 + tanh_z) + 0.5 * x * sech2_z * dz_dx)
                })
                .collect();
            self.a.accumulate_grad(grad_a);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Inverted dropout: zero each element with probability `p`, scale the rest by `1/(1-p)`
///
/// Identity outside training mode or when `p == 0`.
pub fn dropout(a: &Tensor, p: f32, ctx: &mut Context) -> Tensor {
    if !ctx.is_training() || p <= 0.0 {
        return a.clone();
    }
    assert!(p < 1.0, "dropout probability must be below 1.0");

    let keep = 1.0 / (1.0 - p);
    let rng = ctx.rng();
    let mask: Array1<f32> = (0..a.len())
        .map(|_| if rng.gen::<f32>() < p { 0.0 } else { keep })
        .collect();
    let data = a.data() * &mask;

    finish(data, a.requires_grad(), |result_grad| {
        Rc::new(DropoutBackward {
            a: a.clone(),
            mask,
            result_grad,
        })
    })
}

struct DropoutBackward {
    a: Tensor,
    mask: Array1<f32>,
    result_grad: GradCell,
}

impl BackwardOp for DropoutBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            self.a.accumulate_grad(grad * &self.mask);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Matrix multiplication
///
/// Computes C = A @ B where:
/// - A is m×k (flattened to length m*k)
/// - B is k×n (flattened to length k*n)
/// - C is m×n (flattened to length m*n)
pub fn matmul(a: &Tensor, b: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    let c = as_matrix(a.data(), m, k).dot(&as_matrix(b.data(), k, n));
    let requires_grad = a.requires_grad() || b.requires_grad();

    finish(flatten(c), requires_grad, |result_grad| {
        Rc::new(MatmulBackward {
            a: a.clone(),
            b: b.clone(),
            m,
            k,
            n,
            result_grad,
        })
    })
}

struct MatmulBackward {
    a: Tensor,
    b: Tensor,
    m: usize,
    k: usize,
    n: usize,
    result_grad: GradCell,
}

impl BackwardOp for MatmulBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let g = as_matrix(grad_output, self.m, self.n);

            // ∂L/∂A = ∂L/∂C @ B^T
            if self.a.requires_grad() {
                let b = as_matrix(self.b.data(), self.k, self.n);
                self.a.accumulate_grad(flatten(g.dot(&b.t())));
            }

            // ∂L/∂B = A^T @ ∂L/∂C
            if self.b.requires_grad() {
                let a = as_matrix(self.a.data(), self.m, self.k);
                self.b.accumulate_grad(flatten(a.t().dot(&g)));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Multiplication by a transposed weight, the layout of a linear layer
///
/// Computes Y = X @ Wᵀ where X is m×k and W is n×k (`[out_features, in_features]`).
pub fn matmul_nt(x: &Tensor, w: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    let y = as_matrix(x.data(), m, k).dot(&as_matrix(w.data(), n, k).t());
    let requires_grad = x.requires_grad() || w.requires_grad();

    finish(flatten(y), requires_grad, |result_grad| {
        Rc::new(MatmulNtBackward {
            x: x.clone(),
            w: w.clone(),
            m,
            k,
            n,
            result_grad,
        })
    })
}

struct MatmulNtBackward {
    x: Tensor,
    w: Tensor,
    m: usize,
    k: usize,
    n: usize,
    result_grad: GradCell,
}

impl BackwardOp for MatmulNtBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let g = as_matrix(grad_output, self.m, self.n);

            // ∂L/∂X = ∂L/∂Y @ W
            if self.x.requires_grad() {
                let w = as_matrix(self.w.data(), self.n, self.k);
                self.x.accumulate_grad(flatten(g.dot(&w)));
            }

            // ∂L/∂W = (∂L/∂Y)^T @ X
            if self.w.requires_grad() {
                let x = as_matrix(self.x.data(), self.m, self.k);
                self.w.accumulate_grad(flatten(g.t().dot(&x)));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x, &self.w]
    }
}

/// Row-wise layer normalization of a `rows x dim` matrix
///
/// LayerNorm(x) = gamma * (x - mean) / sqrt(var + epsilon) + beta, per row
pub fn layer_norm(
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    rows: usize,
    dim: usize,
    epsilon: f32,
) -> Tensor {
    assert_eq!(gamma.len(), dim, "gamma length must equal dim");
    assert_eq!(beta.len(), dim, "beta length must equal dim");

    let input = as_matrix(x.data(), rows, dim);
    let mut normalized = Array2::<f32>::zeros((rows, dim));
    let mut inv_std = Array1::<f32>::zeros(rows);

    for (r, row) in input.outer_iter().enumerate() {
        let mean = row.sum() / dim as f32;
        let variance = row.mapv(|v| (v - mean).powi(2)).sum() / dim as f32;
        let inv = 1.0 / (variance + epsilon).sqrt();
        inv_std[r] = inv;
        normalized
            .row_mut(r)
            .assign(&row.mapv(|v| (v - mean) * inv));
    }

    let out = &normalized * &gamma.data().view() + &beta.data().view();
    let requires_grad = x.requires_grad() || gamma.requires_grad() || beta.requires_grad();

    finish(flatten(out), requires_grad, |result_grad| {
        Rc::new(LayerNormBackward {
            x: x.clone(),
            gamma: gamma.clone(),
            beta: beta.clone(),
            normalized,
            inv_std,
            rows,
            dim,
            result_grad,
        })
    })
}

struct LayerNormBackward {
    x: Tensor,
    gamma: Tensor,
    beta: Tensor,
    normalized: Array2<f32>,
    inv_std: Array1<f32>,
    rows: usize,
    dim: usize,
    result_grad: GradCell,
}

impl BackwardOp for LayerNormBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let g = as_matrix(grad_output, self.rows, self.dim);

            if self.beta.requires_grad() {
                self.beta.accumulate_grad(g.sum_axis(Axis(0)));
            }

            if self.gamma.requires_grad() {
                self.gamma
                    .accumulate_grad((&g * &self.normalized).sum_axis(Axis(0)));
            }

            if self.x.requires_grad() {
                let n = self.dim as f32;
                let grad_normalized = &g * &self.gamma.data().view();
                let mut grad_x = Array2::<f32>::zeros((self.rows, self.dim));

                // ∂L/∂x_i = inv_std * (gn_i - mean(gn) - x̂_i * mean(gn ⊙ x̂)), per row
                for r in 0..self.rows {
                    let gn = grad_normalized.row(r);
                    let xhat = self.normalized.row(r);
                    let sum_gn = gn.sum();
                    let sum_gn_xhat = (&gn * &xhat).sum();
                    let inv = self.inv_std[r];
                    let row: Array1<f32> = gn
                        .iter()
                        .zip(xhat.iter())
                        .map(|(&gn_i, &xhat_i)| {
                            inv * (gn_i - sum_gn / n - xhat_i * sum_gn_xhat / n)
                        })
                        .collect();
                    grad_x.row_mut(r).assign(&row);
                }

                self.x.accumulate_grad(flatten(grad_x));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x, &self.gamma, &self.beta]
    }
}

/// Shape of a batched multi-head attention call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttentionShape {
    /// Number of sequences in the batch
    pub batch: usize,
    /// Tokens per sequence
    pub seq_len: usize,
    /// Number of heads
    pub num_heads: usize,
    /// Dimension of each head
    pub head_dim: usize,
}

impl AttentionShape {
    fn rows(&self) -> usize {
        self.batch * self.seq_len
    }

    fn hidden(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

/// Causal multi-head scaled dot-product attention
///
/// `q`, `k`, `v` are `(batch * seq_len) x (num_heads * head_dim)` matrices
/// with heads laid out contiguously along the columns. Each position attends
/// to itself and earlier positions of its own sequence:
/// softmax(scale · Q Kᵀ + causal mask) V, computed per (sequence, head).
pub fn causal_attention(q: &Tensor, k: &Tensor, v: &Tensor, shape: AttentionShape, scale: f32) -> Tensor {
    let (rows, hidden) = (shape.rows(), shape.hidden());
    let (qm, km, vm) = (
        as_matrix(q.data(), rows, hidden),
        as_matrix(k.data(), rows, hidden),
        as_matrix(v.data(), rows, hidden),
    );

    let mut out = Array2::<f32>::zeros((rows, hidden));
    let mut probs = Vec::with_capacity(shape.batch * shape.num_heads);

    for b in 0..shape.batch {
        let r = b * shape.seq_len..(b + 1) * shape.seq_len;
        for h in 0..shape.num_heads {
            let c = h * shape.head_dim..(h + 1) * shape.head_dim;
            let qh = qm.slice(s![r.clone(), c.clone()]);
            let kh = km.slice(s![r.clone(), c.clone()]);
            let vh = vm.slice(s![r.clone(), c.clone()]);

            let mut p = qh.dot(&kh.t()) * scale;
            for (i, mut row) in p.outer_iter_mut().enumerate() {
                // Softmax over the causal prefix only
                let max_val = row
                    .iter()
                    .take(i + 1)
                    .fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                let mut sum_exp = 0.0;
                for (j, x) in row.iter_mut().enumerate() {
                    if j <= i {
                        *x = (*x - max_val).exp();
                        sum_exp += *x;
                    } else {
                        *x = 0.0;
                    }
                }
                row.mapv_inplace(|x| x / sum_exp);
            }

            out.slice_mut(s![r.clone(), c]).assign(&p.dot(&vh));
            probs.push(p);
        }
    }

    let requires_grad = q.requires_grad() || k.requires_grad() || v.requires_grad();

    finish(flatten(out), requires_grad, |result_grad| {
        Rc::new(AttentionBackward {
            q: q.clone(),
            k: k.clone(),
            v: v.clone(),
            probs,
            shape,
            scale,
            result_grad,
        })
    })
}

struct AttentionBackward {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    probs: Vec<Array2<f32>>,
    shape: AttentionShape,
    scale: f32,
    result_grad: GradCell,
}

impl BackwardOp for AttentionBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let shape = self.shape;
            let (rows, hidden) = (shape.rows(), shape.hidden());
            let g = as_matrix(grad_output, rows, hidden);
            let (qm, km, vm) = (
                as_matrix(self.q.data(), rows, hidden),
                as_matrix(self.k.data(), rows, hidden),
                as_matrix(self.v.data(), rows, hidden),
            );

            let mut grad_q = Array2::<f32>::zeros((rows, hidden));
            let mut grad_k = Array2::<f32>::zeros((rows, hidden));
            let mut grad_v = Array2::<f32>::zeros((rows, hidden));

            for b in 0..shape.batch {
                let r = b * shape.seq_len..(b + 1) * shape.seq_len;
                for h in 0..shape.num_heads {
                    let c = h * shape.head_dim..(h + 1) * shape.head_dim;
                    let p = &self.probs[b * shape.num_heads + h];
                    let gh = g.slice(s![r.clone(), c.clone()]);
                    let qh = qm.slice(s![r.clone(), c.clone()]);
                    let kh = km.slice(s![r.clone(), c.clone()]);
                    let vh = vm.slice(s![r.clone(), c.clone()]);

                    // ∂L/∂V = Pᵀ @ ∂L/∂O
                    grad_v
                        .slice_mut(s![r.clone(), c.clone()])
                        .assign(&p.t().dot(&gh));

                    // Softmax backward: dS = P ⊙ (dP - rowsum(dP ⊙ P))
                    let dp = gh.dot(&vh.t());
                    let row_dot = (&dp * p).sum_axis(Axis(1)).insert_axis(Axis(1));
                    let ds = p * &(&dp - &row_dot) * self.scale;

                    grad_q
                        .slice_mut(s![r.clone(), c.clone()])
                        .assign(&ds.dot(&kh));
                    grad_k
                        .slice_mut(s![r.clone(), c])
                        .assign(&ds.t().dot(&qh));
                }
            }

            if self.q.requires_grad() {
                self.q.accumulate_grad(flatten(grad_q));
            }
            if self.k.requires_grad() {
                self.k.accumulate_grad(flatten(grad_k));
            }
            if self.v.requires_grad() {
                self.v.accumulate_grad(flatten(grad_v));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.q, &self.k, &self.v]
    }
}

/// Gather rows of a `vocab x dim` table for each id
///
/// Returns an `ids.len() x dim` matrix. The gradient scatters back into the
/// selected rows, so a row picked twice receives both contributions.
pub fn embedding(weight: &Tensor, ids: &[u32], dim: usize) -> Tensor {
    let vocab = weight.len() / dim;
    let table = as_matrix(weight.data(), vocab, dim);
    let mut out = Array2::<f32>::zeros((ids.len(), dim));
    for (row, &id) in ids.iter().enumerate() {
        out.row_mut(row).assign(&table.row(id as usize));
    }

    finish(flatten(out), weight.requires_grad(), |result_grad| {
        Rc::new(EmbeddingBackward {
            weight: weight.clone(),
            ids: ids.to_vec(),
            vocab,
            dim,
            result_grad,
        })
    })
}

struct EmbeddingBackward {
    weight: Tensor,
    ids: Vec<u32>,
    vocab: usize,
    dim: usize,
    result_grad: GradCell,
}

impl BackwardOp for EmbeddingBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let g = as_matrix(grad_output, self.ids.len(), self.dim);
            let mut grad_weight = Array2::<f32>::zeros((self.vocab, self.dim));
            for (row, &id) in self.ids.iter().enumerate() {
                let mut target = grad_weight.row_mut(id as usize);
                target += &g.row(row);
            }
            self.weight.accumulate_grad(flatten(grad_weight));
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.weight]
    }
}

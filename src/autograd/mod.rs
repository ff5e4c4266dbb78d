//! Tape-based autograd engine
//!
//! Provides automatic differentiation using a computational graph with gradient tape.
//! Tensors are flat `f32` buffers; operations take their logical shapes as
//! explicit dimensions (row-major).

mod backward;
mod context;
mod ops;
mod tensor;


pub use backward::BackwardOp;
pub use context::Context;
pub use ops::*;
pub use tensor::{GradCell, Tensor};

use ndarray::Array1;
use std::collections::HashSet;

/// Perform backward pass on a tensor
///
/// Seeds the output gradient (ones when `grad_output` is `None`) and runs
/// every recorded operation once, outputs before inputs, so a tensor that
/// feeds several operations receives its full gradient before propagating.
pub fn backward(tensor: &Tensor, grad_output: Option<Array1<f32>>) {
    let seed = grad_output.unwrap_or_else(|| Array1::ones(tensor.len()));
    tensor.set_grad(seed);

    for node in topological_order(tensor).iter().rev() {
        if let Some(op) = node.backward_op() {
            op.backward();
        }
    }
}

/// Nodes reachable from `root`, every input listed before its consumers
fn topological_order(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root.clone(), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.node_id()) {
            continue;
        }
        let op = node.backward_op();
        stack.push((node, true));
        if let Some(op) = op {
            for input in op.inputs() {
                if input.requires_grad() && !visited.contains(&input.node_id()) {
                    stack.push((input.clone(), false));
                }
            }
        }
    }

    order
}

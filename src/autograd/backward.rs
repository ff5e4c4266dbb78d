//! Backward operation trait

use super::Tensor;

/// Trait for backward pass operations
///
/// An operation reads the gradient of the tensor it produced and accumulates
/// the corresponding gradients into its inputs. Traversal order is owned by
/// [`super::backward`], so implementations must not recurse.
pub trait BackwardOp {
    /// Propagate the output gradient into the inputs
    fn backward(&self);

    /// Inputs recorded by this operation
    fn inputs(&self) -> Vec<&Tensor>;
}

use crate::learn::neural_network::autograd::{Variable2, Variable4};
use anyhow::Result;
use ndarray::linalg::Dot;

/// Computes the normalized Gram matrix of a feature map.
///
/// A feature map `[a, b, c, d]` is reshaped into features `[a * b, c * d]`, then
/// `features.dot(features.t()) / (a * b * c * d)`.
///
/// The result is symmetric, with a non-negative diagonal.
pub fn gram_matrix(input: Variable4) -> Result<Variable2> {
    let (a, b, c, d) = input.dim();
    let len = (a * b * c * d).max(1);
    let features = input.into_shape([a * b, c * d])?;
    let gram = features.dot(&features.t())?;
    Ok(gram.scale(1. / len as f32))
}

/// Criterion.
pub mod criterion;
/// Neural networks.
pub mod neural_network;

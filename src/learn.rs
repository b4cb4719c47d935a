/// Criterion.
pub mod criterion;
/// Neural Networks.
pub mod neural_network;

/*!
# Neural style transfer

A [`FeatureNetwork`] is a frozen sequence of convolution, activation, pooling and batch
normalization stages. [`FeaturePipeline::builder`] rebuilds it into a [`FeaturePipeline`],
inserting [`ContentLoss`] and [`StyleLoss`] probes after the named stages, and
[`StyleTransfer`] optimizes an image against the losses recorded by the probes.

Stages are named by the index of the preceding convolution: "conv_1", "relu_1", "conv_2",
"relu_2", "maxpool_2", ...
*/

/// Gram statistics.
pub mod gram;
/// Network rebuilding into a pipeline with probes.
pub mod pipeline;
/// Content and style loss probes.
pub mod probe;
/// Frozen feature networks.
pub mod network;
/// The optimization loop.
pub mod transfer;

pub use gram::gram_matrix;
pub use network::{FeatureNetwork, NetworkStage};
pub use pipeline::{FeaturePipeline, Stage};
pub use probe::{ContentLoss, StyleLoss};
pub use transfer::{ProgressReport, StyleTransfer, StyleTransferOptions, StyleTransferOutput};

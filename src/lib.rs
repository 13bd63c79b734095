/*!
# stylegraph
Neural style transfer in Rust.

Given a content image and a style image, [`style::StyleTransfer`] optimizes the pixels of an
output image so that its activations in a frozen, pretrained convolutional network match the
content image's activations, while the Gram statistics of its activations match the style
image's.

The crate is organized like a small machine learning library:
- [`tensor`]: f32 tensors over [`ndarray`].
- [`learn::neural_network::autograd`]: [`Variable`](learn::neural_network::autograd::Variable)s,
  reverse-mode autodiff, and [`Parameter`](learn::neural_network::autograd::Parameter)s.
- [`learn::neural_network::layer`]: frozen convolution, activation, pooling and normalization layers.
- [`learn::neural_network::optimizer`]: L-BFGS.
- [`style`]: Gram statistics, loss probes, the feature pipeline builder and the optimization loop.

# Example
```no_run
# use anyhow::Result;
# fn main() -> Result<()> {
use stylegraph::{
    style::{FeatureNetwork, StyleTransfer, StyleTransferOptions},
    tensor::Tensor4,
};

let network = FeatureNetwork::vgg19_random(0)?;
let content = Tensor4::from_elem([1, 3, 64, 64], 0.5);
let style = Tensor4::from_elem([1, 3, 64, 64], 0.25);
let options = StyleTransferOptions::default().with_num_steps(10);
let output = StyleTransfer::new(network)
    .with_options(options)
    .run(content.view(), style.view())?;
assert_eq!(output.image().shape(), &[1, 3, 64, 64]);
# Ok(())
# }
```
*/
#![warn(missing_docs)]
#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]

/// Errors.
pub mod error;
/// Image loading and saving.
#[cfg(feature = "image")]
pub mod image;
/// Machine learning.
pub mod learn;
/// Neural style transfer.
pub mod style;
/// Tensors.
pub mod tensor;

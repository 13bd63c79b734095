/*!
# Example
A small feature extractor might look like this:
```
# use anyhow::Result;
# fn main() -> Result<()> {
use stylegraph::{
    learn::neural_network::{
        autograd::Variable4,
        layer::{Conv2, Forward, MaxPool2, Relu},
    },
    tensor::Tensor4,
};

let conv = Conv2::builder()
    .inputs(3)
    .outputs(8)
    .filter([3, 3])
    .padding([1, 1])
    .bias(true)
    .build()?;
let pool = MaxPool2::builder().size([2, 2]).strides([2, 2]).build()?;
let x = Variable4::from(Tensor4::zeros([1, 3, 16, 16]));
let y = x.forward(&conv)?.forward(&Relu::default())?.forward(&pool)?;
assert_eq!(y.shape(), &[1, 8, 8, 8]);
# Ok(())
# }
```
*/

/// Variables and Parameters
pub mod autograd;
/// Layers
pub mod layer;
/// Optimizers
pub mod optimizer;

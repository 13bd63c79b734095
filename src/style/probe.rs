use super::gram::gram_matrix;
use crate::{
    learn::{
        criterion::{Criterion, MSELoss},
        neural_network::{
            autograd::{Variable0, Variable4},
            layer::{Forward, Layer},
        },
    },
    tensor::{ArcTensor2, ArcTensor4},
};
use anyhow::Result;
use parking_lot::RwLock;

/// Content loss probe.
///
/// Records the mean squared error between its input and a frozen target feature map, and
/// returns the input unchanged.
#[derive(Debug)]
pub struct ContentLoss {
    target: ArcTensor4,
    loss: RwLock<Option<Variable0>>,
}

impl ContentLoss {
    /// Creates a probe with the value of `target`.
    ///
    /// The target is detached, no gradient is computed for it.
    pub fn new(target: &Variable4) -> Self {
        Self {
            target: target.value().clone(),
            loss: RwLock::default(),
        }
    }
    /// The target feature map.
    pub fn target(&self) -> &ArcTensor4 {
        &self.target
    }
    /// The loss of the last forward pass.
    pub fn loss(&self) -> Option<Variable0> {
        self.loss.read().clone()
    }
}

impl Layer for ContentLoss {}

impl Forward<Variable4> for ContentLoss {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let loss = MSELoss.eval(input.clone(), self.target.clone())?;
        self.loss.write().replace(loss);
        Ok(input)
    }
}

/// Style loss probe.
///
/// Records the mean squared error between the [Gram matrix](gram_matrix) of its input and a
/// frozen target Gram matrix, and returns the input unchanged.
#[derive(Debug)]
pub struct StyleLoss {
    target: ArcTensor2,
    loss: RwLock<Option<Variable0>>,
}

impl StyleLoss {
    /// Creates a probe with the Gram matrix of `target`.
    ///
    /// The target is detached, no gradient is computed for it.
    pub fn new(target: &Variable4) -> Result<Self> {
        let target = gram_matrix(target.detach())?.into_value();
        Ok(Self {
            target,
            loss: RwLock::default(),
        })
    }
    /// The target Gram matrix.
    pub fn target(&self) -> &ArcTensor2 {
        &self.target
    }
    /// The loss of the last forward pass.
    pub fn loss(&self) -> Option<Variable0> {
        self.loss.read().clone()
    }
}

impl Layer for StyleLoss {}

impl Forward<Variable4> for StyleLoss {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let gram = gram_matrix(input.clone())?;
        let loss = MSELoss.eval(gram, self.target.clone())?;
        self.loss.write().replace(loss);
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::StyleTransferError, learn::neural_network::autograd::Parameter4, tensor::Tensor4,
    };
    use approx::assert_relative_eq;

    fn tensor4(dim: [usize; 4], offset: f32) -> Tensor4 {
        let len = dim.iter().product::<usize>();
        Tensor4::from_shape_vec(dim, (0..len).map(|x| x as f32 * 0.1 + offset).collect()).unwrap()
    }

    #[test]
    fn content_loss_passthrough() {
        let target = Variable4::from(tensor4([1, 2, 3, 3], 0.));
        let probe = ContentLoss::new(&target);
        assert!(probe.loss().is_none());
        let x = Variable4::from(tensor4([1, 2, 3, 3], 0.5));
        let y = probe.forward(x.clone()).unwrap();
        assert_eq!(y.value(), x.value());
        assert_relative_eq!(probe.loss().unwrap().scalar(), 0.25, max_relative = 1e-5);
    }

    #[test]
    fn content_loss_zero_at_target() {
        let target = Variable4::from(tensor4([1, 3, 2, 2], -1.));
        let probe = ContentLoss::new(&target);
        probe.forward(target.clone()).unwrap();
        assert_eq!(probe.loss().unwrap().scalar(), 0.);
    }

    #[test]
    fn content_loss_shape_mismatch() {
        let probe = ContentLoss::new(&Variable4::from(tensor4([1, 2, 3, 3], 0.)));
        let error = probe
            .forward(Variable4::from(tensor4([1, 2, 4, 3], 0.)))
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<StyleTransferError>(),
            Some(&StyleTransferError::ShapeMismatch {
                expected: vec![1, 2, 3, 3],
                found: vec![1, 2, 4, 3],
            })
        );
    }

    #[test]
    fn content_loss_target_is_detached() {
        let mut parameter = Parameter4::from(tensor4([1, 1, 2, 2], 0.));
        parameter.set_training(true);
        let target = parameter.to_variable();
        let probe = ContentLoss::new(&target);
        let mut input = Parameter4::from(tensor4([1, 1, 2, 2], 1.));
        input.set_training(true);
        probe.forward(input.to_variable()).unwrap();
        probe.loss().unwrap().backward().unwrap();
        assert!(parameter.grad().is_none());
        let grad = input.grad().unwrap();
        assert!(grad.iter().all(|dx| (*dx - 0.5).abs() < 1e-6));
    }

    #[test]
    fn style_loss_passthrough() {
        let style = Variable4::from(tensor4([1, 2, 3, 3], 0.));
        let probe = StyleLoss::new(&style).unwrap();
        assert_eq!(probe.target().shape(), &[2, 2]);
        let y = probe.forward(style.clone()).unwrap();
        assert_eq!(y.value(), style.value());
        assert_eq!(probe.loss().unwrap().scalar(), 0.);
        // Spatial layout does not change the gram matrix.
        let mut flipped = style.value().to_owned();
        flipped.invert_axis(ndarray::Axis(3));
        probe.forward(Variable4::from(flipped)).unwrap();
        assert_relative_eq!(probe.loss().unwrap().scalar(), 0., epsilon = 1e-6);
        probe.forward(Variable4::from(tensor4([1, 2, 3, 3], 1.))).unwrap();
        assert!(probe.loss().unwrap().scalar() > 0.);
    }

    #[test]
    fn style_loss_channel_mismatch() {
        let probe = StyleLoss::new(&Variable4::from(tensor4([1, 2, 3, 3], 0.))).unwrap();
        let error = probe
            .forward(Variable4::from(tensor4([1, 3, 3, 3], 0.)))
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<StyleTransferError>(),
            Some(StyleTransferError::ShapeMismatch { .. })
        ));
    }
}

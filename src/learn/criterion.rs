use super::neural_network::autograd::{Variable, Variable0};
use crate::{error::StyleTransferError, tensor::ArcTensor};
use anyhow::Result;
use ndarray::{ArcArray, ArrayBase, Data, Dimension, Zip};

/// Criterion.
///
/// Compares an input with a target.
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates the criterion.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Mean squared error.
///
/// `mean((input - target)^2)`
#[derive(Default, Clone, Copy, Debug)]
pub struct MSELoss;

fn check_shape(input: &[usize], target: &[usize]) -> Result<()> {
    if input != target {
        return Err(StyleTransferError::shape_mismatch(target, input).into());
    }
    Ok(())
}

fn mse_host<S1, S2, D>(input: &ArrayBase<S1, D>, target: &ArrayBase<S2, D>) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    let len = input.len();
    if len == 0 {
        return 0.;
    }
    let sum = Zip::from(input)
        .and(target)
        .fold(0f32, |acc, x, t| acc + (x - t) * (x - t));
    sum / len as f32
}

impl<S1, S2, D> Criterion<&ArrayBase<S1, D>, &ArrayBase<S2, D>> for MSELoss
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    type Output = f32;
    fn eval(&self, input: &ArrayBase<S1, D>, target: &ArrayBase<S2, D>) -> Result<f32> {
        check_shape(input.shape(), target.shape())?;
        Ok(mse_host(input, target))
    }
}

impl<D: Dimension + 'static> Criterion<Variable<D>, ArcTensor<D>> for MSELoss {
    type Output = Variable0;
    fn eval(&self, input: Variable<D>, target: ArcTensor<D>) -> Result<Variable0> {
        check_shape(input.shape(), target.shape())?;
        let mut builder = Variable0::builder();
        if let Some(node) = input.node() {
            let input = input.value().clone();
            let target = target.clone();
            builder.edge(node, move |output_grad: ArcTensor<ndarray::Ix0>| {
                let scale = 2. * output_grad[()] / input.len().max(1) as f32;
                let mut input_grad = ArcArray::zeros(input.raw_dim());
                Zip::from(&mut input_grad)
                    .and(&input)
                    .and(&target)
                    .for_each(|dx, x, t| *dx = scale * (x - t));
                Ok(input_grad)
            });
        }
        let value = mse_host(input.value(), &target);
        Ok(builder.build(ArcArray::from_elem((), value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{learn::neural_network::autograd::Parameter, tensor::Tensor2};
    use approx::assert_relative_eq;

    #[test]
    fn mse_host_value() {
        let x = Tensor2::from_shape_vec([2, 2], vec![1., 2., 3., 4.]).unwrap();
        let t = Tensor2::zeros([2, 2]);
        assert_relative_eq!(MSELoss.eval(&x, &t).unwrap(), 7.5);
        assert_eq!(MSELoss.eval(&x, &x).unwrap(), 0.);
    }

    #[test]
    fn mse_shape_mismatch() {
        let x = Tensor2::zeros([2, 2]);
        let t = Tensor2::zeros([2, 3]);
        let error = MSELoss.eval(&x, &t).unwrap_err();
        assert_eq!(
            error.downcast_ref::<StyleTransferError>(),
            Some(&StyleTransferError::ShapeMismatch {
                expected: vec![2, 3],
                found: vec![2, 2],
            })
        );
    }

    #[test]
    fn mse_variable_backward() {
        let x = Tensor2::from_shape_vec([1, 4], vec![1., -1., 0.5, 2.]).unwrap();
        let mut parameter = Parameter::from(x.clone());
        parameter.set_training(true);
        let target = Tensor2::ones([1, 4]).into_shared();
        let loss = MSELoss.eval(parameter.to_variable(), target.clone()).unwrap();
        assert_relative_eq!(loss.scalar(), MSELoss.eval(&x, &target).unwrap());
        loss.backward().unwrap();
        let grad = parameter.grad().unwrap();
        for (dx, (x, t)) in grad.iter().zip(x.iter().zip(target.iter())) {
            assert_relative_eq!(*dx, 2. * (x - t) / 4.);
        }
    }
}

use super::autograd::{Variable, Variable4};
use crate::{
    error::StyleTransferError,
    tensor::{channel_broadcast, ArcTensor, ArcTensor1, ArcTensor4, ArcTensorD, Tensor1, Tensor4},
};
use anyhow::{bail, Result};
use ndarray::{Array3, Axis, Dimension, Zip};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod im2col;
use im2col::{conv2_im2col_backward_input, conv2_im2col_forward};

/// Layer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Conv2`].
    #[derive(Debug, Clone)]
    pub struct Conv2Builder {
        inputs: usize,
        outputs: usize,
        filter: [usize; 2],
        padding: [usize; 2],
        strides: [usize; 2],
        bias: bool,
        weight: Option<ArcTensor4>,
        bias_value: Option<ArcTensor1>,
        seed: Option<u64>,
    }

    impl Conv2Builder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 0,
                outputs: 0,
                filter: [1, 1],
                padding: [0, 0],
                strides: [1, 1],
                bias: false,
                weight: None,
                bias_value: None,
                seed: None,
            }
        }
        /// Number of input channels.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// Number of output channels.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Filter size. Default is [1, 1].
        pub fn filter(self, filter: [usize; 2]) -> Self {
            Self { filter, ..self }
        }
        /// Zero padding added to both sides of the input. Default is 0.
        pub fn padding(self, padding: [usize; 2]) -> Self {
            Self { padding, ..self }
        }
        /// Strides. Default is 1.
        pub fn strides(self, strides: [usize; 2]) -> Self {
            Self { strides, ..self }
        }
        /// Whether to add a bias. Default is false.
        ///
        /// The bias is initialized to zeros.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Uses `weight` instead of a random initialization.
        ///
        /// The weight shape `[outputs, inputs, fh, fw]` overrides `inputs`, `outputs` and `filter`.
        pub fn weight(self, weight: impl Into<ArcTensor4>) -> Self {
            Self {
                weight: Some(weight.into()),
                ..self
            }
        }
        /// Uses `bias` instead of zeros, implies [`.bias(true)`](Self::bias).
        pub fn bias_value(self, bias: impl Into<ArcTensor1>) -> Self {
            Self {
                bias: true,
                bias_value: Some(bias.into()),
                ..self
            }
        }
        /// Seeds the random initialization.
        pub fn seed(self, seed: u64) -> Self {
            Self {
                seed: Some(seed),
                ..self
            }
        }
        /// Builds the layer.
        ///
        /// The weight is initialized with a uniform distribution of (-a, a) where
        /// a = sqrt(6 / (inputs * fh * fw)).
        ///
        /// **Errors**
        /// - The filter or strides are 0.
        /// - The bias does not have `outputs` elements.
        pub fn build(self) -> Result<Conv2> {
            let Self {
                inputs,
                outputs,
                filter,
                padding,
                strides,
                bias,
                weight,
                bias_value,
                seed,
            } = self;
            let weight = if let Some(weight) = weight {
                weight
            } else {
                he_uniform_weight([outputs, inputs, filter[0], filter[1]], seed)?.into_shared()
            };
            let (outputs, inputs, fh, fw) = weight.dim();
            if outputs == 0 || inputs == 0 {
                bail!(StyleTransferError::InvalidOption(format!(
                    "Conv2 inputs {inputs} and outputs {outputs} must be positive"
                )));
            }
            if fh == 0 || fw == 0 {
                bail!(StyleTransferError::InvalidOption(format!(
                    "Conv2 filter {:?} must be positive",
                    [fh, fw]
                )));
            }
            if strides.contains(&0) {
                bail!(StyleTransferError::InvalidOption(format!(
                    "Conv2 strides {strides:?} must be positive"
                )));
            }
            let bias = match (bias, bias_value) {
                (_, Some(bias)) => {
                    if bias.len() != outputs {
                        bail!(StyleTransferError::shape_mismatch(&[outputs], bias.shape()));
                    }
                    Some(bias)
                }
                (true, None) => Some(Tensor1::zeros(outputs).into_shared()),
                (false, None) => None,
            };
            Ok(Conv2 {
                weight,
                bias,
                padding,
                strides,
            })
        }
    }

    /// Builder for creating a [`MaxPool2`].
    #[derive(Debug, Clone)]
    pub struct MaxPool2Builder {
        size: [usize; 2],
        strides: Option<[usize; 2]>,
    }

    impl MaxPool2Builder {
        pub(super) fn new() -> Self {
            Self {
                size: [2, 2],
                strides: None,
            }
        }
        /// Window size. Default is [2, 2].
        pub fn size(self, size: [usize; 2]) -> Self {
            Self { size, ..self }
        }
        /// Strides. Defaults to the window size.
        pub fn strides(self, strides: [usize; 2]) -> Self {
            Self {
                strides: Some(strides),
                ..self
            }
        }
        /// Builds the layer.
        ///
        /// **Errors**
        /// The size or strides are 0.
        pub fn build(self) -> Result<MaxPool2> {
            let size = self.size;
            let strides = self.strides.unwrap_or(size);
            if size.contains(&0) || strides.contains(&0) {
                bail!(StyleTransferError::InvalidOption(format!(
                    "MaxPool2 size {size:?} and strides {strides:?} must be positive"
                )));
            }
            Ok(MaxPool2 { size, strides })
        }
    }
}
use builder::*;

fn he_uniform_weight(dim: [usize; 4], seed: Option<u64>) -> Result<Tensor4> {
    let fan_in = dim[1] * dim[2] * dim[3];
    let a = (6. / fan_in.max(1) as f32).sqrt();
    let distribution = Uniform::new(-a, a);
    let len = dim.iter().product();
    let data: Vec<f32> = if let Some(seed) = seed {
        distribution
            .sample_iter(StdRng::seed_from_u64(seed))
            .take(len)
            .collect()
    } else {
        distribution
            .sample_iter(rand::thread_rng())
            .take(len)
            .collect()
    };
    Ok(Tensor4::from_shape_vec(dim, data)?)
}

/// A trait for layers.
///
/// Layers are frozen: their tensors are never updated and no gradient is computed for them.
pub trait Layer {
    /// The tensors of the layer.
    fn parameters(&self) -> Vec<ArcTensorD> {
        Vec::new()
    }
    /// The number of elements of [`.parameters()`](Self::parameters).
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|x| x.len()).sum()
    }
}

/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
pub trait Forward<X> {
    /// The output.
    type Output;
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`] apply backward ops via
    /// [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

fn check_channels(expected: usize, input: &Variable4) -> Result<()> {
    let found = input.shape()[1];
    if found != expected {
        bail!(StyleTransferError::ChannelMismatch { expected, found });
    }
    Ok(())
}

/// Filter, padding and strides of a 2d convolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Conv2Options {
    pub(crate) filter: [usize; 2],
    pub(crate) padding: [usize; 2],
    pub(crate) strides: [usize; 2],
}

impl Conv2Options {
    pub(crate) fn output_shape(&self, [ih, iw]: [usize; 2]) -> Result<[usize; 2]> {
        let [fh, fw] = self.filter;
        let [ph, pw] = self.padding;
        let [sh, sw] = self.strides;
        let (h, w) = (ih + 2 * ph, iw + 2 * pw);
        if h < fh || w < fw {
            bail!(StyleTransferError::InvalidOption(format!(
                "input [{ih}, {iw}] with padding {:?} is smaller than filter {:?}",
                self.padding, self.filter
            )));
        }
        Ok([(h - fh) / sh + 1, (w - fw) / sw + 1])
    }
}

/// Convolutional layer.
///
/// The weight has shape `[outputs, inputs, fh, fw]`.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "checked::Conv2Parts")
)]
pub struct Conv2 {
    weight: ArcTensor4,
    bias: Option<ArcTensor1>,
    padding: [usize; 2],
    strides: [usize; 2],
}

impl Conv2 {
    /// Returns a builder for creating a [`Conv2`].
    pub fn builder() -> Conv2Builder {
        Conv2Builder::new()
    }
    /// The weight.
    pub fn weight(&self) -> &ArcTensor4 {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ArcTensor1> {
        self.bias.as_ref()
    }
    /// The number of input channels.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1]
    }
    /// The number of output channels.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
    /// The filter size.
    pub fn filter(&self) -> [usize; 2] {
        [self.weight.shape()[2], self.weight.shape()[3]]
    }
    /// The padding.
    pub fn padding(&self) -> [usize; 2] {
        self.padding
    }
    /// The strides.
    pub fn strides(&self) -> [usize; 2] {
        self.strides
    }
    fn options(&self) -> Conv2Options {
        Conv2Options {
            filter: self.filter(),
            padding: self.padding,
            strides: self.strides,
        }
    }
}

impl Layer for Conv2 {
    fn parameters(&self) -> Vec<ArcTensorD> {
        std::iter::once(self.weight.clone().into_dyn())
            .chain(self.bias.clone().map(|bias| bias.into_dyn()))
            .collect()
    }
}

impl Forward<Variable4> for Conv2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        check_channels(self.inputs(), &input)?;
        let options = self.options();
        let output = conv2_im2col_forward(
            input.value().view(),
            self.weight.view(),
            self.bias.as_ref().map(|bias| bias.view()),
            &options,
        )?;
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight = self.weight.clone();
            let (bs, ic, ih, iw) = input.dim();
            let input_dim = [bs, ic, ih, iw];
            builder.edge(node, move |output_grad: ArcTensor4| {
                conv2_im2col_backward_input(output_grad.view(), weight.view(), input_dim, &options)
                    .map(Tensor4::into_shared)
            });
        }
        Ok(builder.build(output.into_shared()))
    }
}

/// ReLU activation.
///
/// An `inplace` relu reuses the buffer of its input when the input is not shared.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Relu {
    #[cfg_attr(feature = "serde", serde(default))]
    inplace: bool,
}

impl Relu {
    /// A relu that reuses the buffer of its input.
    pub fn inplace() -> Self {
        Self { inplace: true }
    }
    /// Sets `inplace`.
    pub fn with_inplace(self, inplace: bool) -> Self {
        Self { inplace }
    }
    /// Whether the relu reuses the buffer of its input.
    pub fn is_inplace(&self) -> bool {
        self.inplace
    }
}

impl Layer for Relu {}

impl<D: Dimension + 'static> Forward<Variable<D>> for Relu {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let node = input.node().cloned();
        let output = if self.inplace {
            let mut value = input.into_value();
            value.mapv_inplace(|x| x.max(0.));
            value
        } else {
            input.value().mapv(|x| x.max(0.)).into_shared()
        };
        let mut builder = Variable::<D>::builder();
        if let Some(node) = node.as_ref() {
            let output = output.clone();
            builder.edge(node, move |output_grad: ArcTensor<D>| {
                Ok(Zip::from(&output_grad)
                    .and(&output)
                    .map_collect(|dy, y| if *y > 0. { *dy } else { 0. })
                    .into_shared())
            });
        }
        Ok(builder.build(output))
    }
}

/// Max pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "checked::MaxPool2Parts")
)]
pub struct MaxPool2 {
    size: [usize; 2],
    strides: [usize; 2],
}

impl MaxPool2 {
    /// Returns a builder for creating a [`MaxPool2`].
    pub fn builder() -> MaxPool2Builder {
        MaxPool2Builder::new()
    }
    /// The window size.
    pub fn size(&self) -> [usize; 2] {
        self.size
    }
    /// The strides.
    pub fn strides(&self) -> [usize; 2] {
        self.strides
    }
}

impl Layer for MaxPool2 {}

impl Forward<Variable4> for MaxPool2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (bs, c, ih, iw) = input.dim();
        let options = Conv2Options {
            filter: self.size,
            padding: [0, 0],
            strides: self.strides,
        };
        let [oh, ow] = options.output_shape([ih, iw])?;
        let x = input.value().as_standard_layout();
        let x = x.view().into_shape([bs * c, ih, iw])?;
        let mut output = Array3::<f32>::zeros([bs * c, oh, ow]);
        let mut indices = Array3::<usize>::zeros([bs * c, oh, ow]);
        let [kh, kw] = self.size;
        let [sh, sw] = self.strides;
        Zip::from(output.axis_iter_mut(Axis(0)))
            .and(indices.axis_iter_mut(Axis(0)))
            .and(x.axis_iter(Axis(0)))
            .par_for_each(|mut y, mut index, x| {
                for (((oi, oj), y), index) in y.indexed_iter_mut().zip(index.iter_mut()) {
                    let (mut max, mut argmax) = (f32::NEG_INFINITY, oi * sh * iw + oj * sw);
                    for i in oi * sh..oi * sh + kh {
                        for j in oj * sw..oj * sw + kw {
                            let x = x[(i, j)];
                            if x > max || x.is_nan() {
                                max = x;
                                argmax = i * iw + j;
                            }
                        }
                    }
                    *y = max;
                    *index = argmax;
                }
            });
        let output = output.into_shape([bs, c, oh, ow])?;
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcTensor4| {
                let output_grad = output_grad.as_standard_layout();
                let output_grad = output_grad.view().into_shape([bs * c, oh * ow])?;
                let mut input_grad = Array3::<f32>::zeros([bs * c, ih, iw]);
                Zip::from(input_grad.axis_iter_mut(Axis(0)))
                    .and(output_grad.axis_iter(Axis(0)))
                    .and(indices.axis_iter(Axis(0)))
                    .par_for_each(|mut dx, dy, index| {
                        for (dy, index) in dy.iter().zip(index.iter()) {
                            dx[(index / iw, index % iw)] += dy;
                        }
                    });
                Ok(input_grad.into_shape([bs, c, ih, iw])?.into_shared())
            });
        }
        Ok(builder.build(output.into_shared()))
    }
}

/// Batch normalization in evaluation mode.
///
/// `(x - running_mean) / sqrt(running_var + eps) * weight + bias`, per channel.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "checked::BatchNorm2Parts")
)]
pub struct BatchNorm2 {
    running_mean: ArcTensor1,
    running_var: ArcTensor1,
    weight: ArcTensor1,
    bias: ArcTensor1,
    eps: f32,
}

impl BatchNorm2 {
    /// Creates a new [`BatchNorm2`] from its statistics and affine parameters.
    ///
    /// **Errors**
    /// - The tensors do not have the same length.
    /// - `running_var + eps` is not positive.
    pub fn new(
        running_mean: impl Into<ArcTensor1>,
        running_var: impl Into<ArcTensor1>,
        weight: impl Into<ArcTensor1>,
        bias: impl Into<ArcTensor1>,
        eps: f32,
    ) -> Result<Self> {
        let running_mean = running_mean.into();
        let running_var = running_var.into();
        let weight = weight.into();
        let bias = bias.into();
        for x in [&running_var, &weight, &bias] {
            if x.len() != running_mean.len() {
                bail!(StyleTransferError::shape_mismatch(
                    running_mean.shape(),
                    x.shape()
                ));
            }
        }
        if running_var.iter().any(|v| !(v + eps > 0.)) {
            bail!(StyleTransferError::InvalidOption(format!(
                "BatchNorm2 running_var {running_var} + eps {eps} must be positive"
            )));
        }
        Ok(Self {
            running_mean,
            running_var,
            weight,
            bias,
            eps,
        })
    }
    /// An identity [`BatchNorm2`] with `channels`.
    pub fn identity(channels: usize) -> Self {
        let zeros = Tensor1::zeros(channels).into_shared();
        let ones = Tensor1::ones(channels).into_shared();
        Self {
            running_mean: zeros.clone(),
            running_var: ones.clone(),
            weight: ones,
            bias: zeros,
            eps: 0.,
        }
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.running_mean.len()
    }
    fn scale(&self) -> ArcTensor1 {
        Zip::from(&self.weight)
            .and(&self.running_var)
            .map_collect(|w, v| w / (v + self.eps).sqrt())
            .into_shared()
    }
}

impl Layer for BatchNorm2 {
    fn parameters(&self) -> Vec<ArcTensorD> {
        [
            &self.running_mean,
            &self.running_var,
            &self.weight,
            &self.bias,
        ]
        .into_iter()
        .map(|x| x.clone().into_dyn())
        .collect()
    }
}

impl Forward<Variable4> for BatchNorm2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        check_channels(self.channels(), &input)?;
        let scale = self.scale();
        let centered = input.value() - &channel_broadcast(&self.running_mean);
        let value = &(&centered * &channel_broadcast(&scale)) + &channel_broadcast(&self.bias);
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcTensor4| {
                Ok((&output_grad * &channel_broadcast(&scale)).into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

/// Per channel normalization, `(x - mean) / std`.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "checked::NormalizationParts")
)]
pub struct Normalization {
    mean: ArcTensor1,
    std: ArcTensor1,
}

impl Normalization {
    /// Creates a new [`Normalization`].
    ///
    /// **Errors**
    /// `mean` and `std` must have the same length and `std` must be positive.
    pub fn new(mean: impl Into<ArcTensor1>, std: impl Into<ArcTensor1>) -> Result<Self> {
        let mean = mean.into();
        let std = std.into();
        if mean.len() != std.len() {
            bail!(StyleTransferError::shape_mismatch(mean.shape(), std.shape()));
        }
        if std.iter().any(|x| !(*x > 0.)) {
            bail!(StyleTransferError::InvalidOption(format!(
                "normalization std {std} must be positive"
            )));
        }
        Ok(Self { mean, std })
    }
    /// The per channel mean.
    pub fn mean(&self) -> &ArcTensor1 {
        &self.mean
    }
    /// The per channel standard deviation.
    pub fn std(&self) -> &ArcTensor1 {
        &self.std
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.mean.len()
    }
}

impl Layer for Normalization {}

impl Forward<Variable4> for Normalization {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        check_channels(self.channels(), &input)?;
        let value = &(input.value() - &channel_broadcast(&self.mean)) / &channel_broadcast(&self.std);
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let std = self.std.clone();
            builder.edge(node, move |output_grad: ArcTensor4| {
                Ok((&output_grad / &channel_broadcast(&std)).into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

/// Deserialized layers are checked like built ones.
#[cfg(feature = "serde")]
mod checked {
    use super::*;

    #[derive(Deserialize)]
    pub(super) struct Conv2Parts {
        weight: ArcTensor4,
        bias: Option<ArcTensor1>,
        padding: [usize; 2],
        strides: [usize; 2],
    }

    impl TryFrom<Conv2Parts> for Conv2 {
        type Error = anyhow::Error;
        fn try_from(parts: Conv2Parts) -> Result<Self> {
            let Conv2Parts {
                weight,
                bias,
                padding,
                strides,
            } = parts;
            let builder = Conv2::builder()
                .weight(weight)
                .padding(padding)
                .strides(strides);
            match bias {
                Some(bias) => builder.bias_value(bias),
                None => builder,
            }
            .build()
        }
    }

    #[derive(Deserialize)]
    pub(super) struct MaxPool2Parts {
        size: [usize; 2],
        strides: [usize; 2],
    }

    impl TryFrom<MaxPool2Parts> for MaxPool2 {
        type Error = anyhow::Error;
        fn try_from(parts: MaxPool2Parts) -> Result<Self> {
            MaxPool2::builder()
                .size(parts.size)
                .strides(parts.strides)
                .build()
        }
    }

    #[derive(Deserialize)]
    pub(super) struct BatchNorm2Parts {
        running_mean: ArcTensor1,
        running_var: ArcTensor1,
        weight: ArcTensor1,
        bias: ArcTensor1,
        eps: f32,
    }

    impl TryFrom<BatchNorm2Parts> for BatchNorm2 {
        type Error = anyhow::Error;
        fn try_from(parts: BatchNorm2Parts) -> Result<Self> {
            let BatchNorm2Parts {
                running_mean,
                running_var,
                weight,
                bias,
                eps,
            } = parts;
            BatchNorm2::new(running_mean, running_var, weight, bias, eps)
        }
    }

    #[derive(Deserialize)]
    pub(super) struct NormalizationParts {
        mean: ArcTensor1,
        std: ArcTensor1,
    }

    impl TryFrom<NormalizationParts> for Normalization {
        type Error = anyhow::Error;
        fn try_from(parts: NormalizationParts) -> Result<Self> {
            Normalization::new(parts.mean, parts.std)
        }
    }
}

/// Random input for gradient checks.
#[cfg(test)]
pub(crate) fn random_tensor4(dim: [usize; 4], seed: u64) -> Tensor4 {
    let distribution = Uniform::new(-1f32, 1.);
    let len = dim.iter().product();
    let data = distribution
        .sample_iter(StdRng::seed_from_u64(seed))
        .take(len)
        .collect();
    Tensor4::from_shape_vec(dim, data).unwrap()
}

/// Compares the gradient of `sum(f(x) * w)` with central differences.
#[cfg(test)]
pub(crate) fn check_gradient<F>(x: Tensor4, f: F, tolerance: f32)
where
    F: Fn(Variable4) -> Result<Variable4>,
{
    use super::autograd::{Parameter, Variable0};
    use crate::tensor::ArcTensor0;
    use approx::assert_abs_diff_eq;

    let mut parameter = Parameter::from(x.clone());
    parameter.set_training(true);
    let output = f(parameter.to_variable()).unwrap();
    let (a, b, c, d) = output.dim();
    let w = random_tensor4([a, b, c, d], 7).into_shared();
    let objective = |y: &ArcTensor4| (y * &w).sum();
    let mut builder = Variable0::builder();
    if let Some(node) = output.node() {
        let w = w.clone();
        builder.edge(node, move |dy: ArcTensor0| {
            Ok(w.mapv(|w| w * dy[()]).into_shared())
        });
    }
    builder
        .build(ArcTensor0::from_elem((), objective(output.value())))
        .backward()
        .unwrap();
    let grad = parameter.grad().unwrap();
    let h = 1e-2;
    for (index, dx) in grad.indexed_iter() {
        let mut plus = x.clone();
        plus[index] += h;
        let mut minus = x.clone();
        minus[index] -= h;
        let f_plus = objective(f(Variable4::from(plus)).unwrap().value());
        let f_minus = objective(f(Variable4::from(minus)).unwrap().value());
        let numerical = (f_plus - f_minus) / (2. * h);
        assert_abs_diff_eq!(*dx, numerical, epsilon = tolerance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv2(padding: [usize; 2], strides: [usize; 2]) -> Conv2 {
        Conv2::builder()
            .inputs(2)
            .outputs(3)
            .filter([3, 3])
            .padding(padding)
            .strides(strides)
            .bias(true)
            .seed(1)
            .build()
            .unwrap()
    }

    #[test]
    fn conv2_shapes() {
        let conv = conv2([1, 1], [1, 1]);
        assert_eq!(conv.inputs(), 2);
        assert_eq!(conv.outputs(), 3);
        assert_eq!(conv.parameter_count(), 3 * 2 * 3 * 3 + 3);
        let y = Variable4::from(Tensor4::zeros([1, 2, 6, 5]))
            .forward(&conv)
            .unwrap();
        assert_eq!(y.shape(), &[1, 3, 6, 5]);
        let y = Variable4::from(Tensor4::zeros([1, 2, 6, 5]))
            .forward(&conv2([0, 0], [2, 2]))
            .unwrap();
        assert_eq!(y.shape(), &[1, 3, 2, 2]);
    }

    #[test]
    fn conv2_channel_mismatch() {
        let error = Variable4::from(Tensor4::zeros([1, 4, 6, 5]))
            .forward(&conv2([1, 1], [1, 1]))
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<StyleTransferError>(),
            Some(&StyleTransferError::ChannelMismatch {
                expected: 2,
                found: 4
            })
        );
    }

    #[test]
    fn conv2_seed_is_deterministic() {
        let a = conv2([1, 1], [1, 1]);
        let b = conv2([1, 1], [1, 1]);
        assert_eq!(a.weight(), b.weight());
    }

    #[test]
    fn conv2_bias_shape() {
        let result = Conv2::builder()
            .inputs(1)
            .outputs(2)
            .bias_value(Tensor1::zeros(3))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn conv2_gradient() {
        let conv = conv2([1, 1], [2, 1]);
        check_gradient(random_tensor4([1, 2, 5, 4], 0), |x| x.forward(&conv), 1e-2);
    }

    #[test]
    fn relu_forward() {
        let x = Tensor4::from_shape_vec([1, 1, 1, 4], vec![-1., 0., 0.5, 2.]).unwrap();
        for relu in [Relu::default(), Relu::inplace()] {
            let y = Variable4::from(x.clone()).forward(&relu).unwrap();
            assert_eq!(y.value().as_slice().unwrap(), &[0., 0., 0.5, 2.]);
        }
    }

    #[test]
    fn relu_does_not_mutate_shared_input() {
        let x = Variable4::from(Tensor4::from_elem([1, 1, 2, 2], -1.));
        let y = x.clone().forward(&Relu::inplace()).unwrap();
        assert!(x.value().iter().all(|x| *x == -1.));
        assert!(y.value().iter().all(|y| *y == 0.));
    }

    #[test]
    fn relu_gradient() {
        // Keep values away from 0 where relu is not differentiable.
        let x = random_tensor4([1, 2, 3, 3], 3).mapv(|x| if x.abs() < 0.1 { 0.5 } else { x });
        check_gradient(x, |x| x.forward(&Relu::default()), 1e-2);
    }

    #[test]
    fn max_pool2_forward() {
        let x = Tensor4::from_shape_vec([1, 1, 2, 4], vec![1., 5., 2., 0., 3., 4., -1., -2.])
            .unwrap();
        let pool = MaxPool2::builder().build().unwrap();
        assert_eq!(pool.strides(), [2, 2]);
        let y = Variable4::from(x).forward(&pool).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 2]);
        assert_eq!(y.value().as_slice().unwrap(), &[5., 2.]);
    }

    #[test]
    fn max_pool2_gradient() {
        let pool = MaxPool2::builder().size([2, 2]).strides([2, 2]).build().unwrap();
        // Distinct values so the argmax is stable under perturbation.
        let x = Tensor4::from_shape_vec(
            [2, 2, 4, 5],
            (0..80).map(|i| ((i * 37) % 80) as f32 * 0.1 - 4.).collect(),
        )
        .unwrap();
        check_gradient(x, |x| x.forward(&pool), 1e-2);
    }

    #[test]
    fn batch_norm2_gradient() {
        let bn = BatchNorm2::new(
            Tensor1::from(vec![0.1, -0.2]),
            Tensor1::from(vec![1.5, 0.5]),
            Tensor1::from(vec![2., -1.]),
            Tensor1::from(vec![0.3, 0.]),
            1e-5,
        )
        .unwrap();
        check_gradient(random_tensor4([1, 2, 3, 2], 5), |x| x.forward(&bn), 1e-2);
    }

    #[test]
    fn batch_norm2_identity() {
        let x = random_tensor4([1, 3, 2, 2], 6);
        let y = Variable4::from(x.clone())
            .forward(&BatchNorm2::identity(3))
            .unwrap();
        assert_eq!(y.value(), &x);
    }

    #[test]
    fn normalization_forward() {
        let norm = Normalization::new(Tensor1::from(vec![0.5, 0.]), Tensor1::from(vec![0.5, 2.]))
            .unwrap();
        let x = Tensor4::from_shape_vec([1, 2, 1, 2], vec![1., 0.5, 4., -2.]).unwrap();
        let y = Variable4::from(x).forward(&norm).unwrap();
        assert_eq!(y.value().as_slice().unwrap(), &[1., 0., 2., -1.]);
        check_gradient(random_tensor4([1, 2, 2, 2], 8), |x| x.forward(&norm), 1e-2);
    }

    #[test]
    fn normalization_invalid() {
        assert!(Normalization::new(Tensor1::zeros(3), Tensor1::ones(2)).is_err());
        assert!(Normalization::new(Tensor1::zeros(2), Tensor1::zeros(2)).is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_checks_layers() {
        let zero_std = r#"{
            "mean": {"v": 1, "dim": [1], "data": [0.0]},
            "std": {"v": 1, "dim": [1], "data": [0.0]}
        }"#;
        assert!(serde_json::from_str::<Normalization>(zero_std).is_err());
        let pool: MaxPool2 = serde_json::from_str(r#"{"size": [3, 3], "strides": [1, 2]}"#).unwrap();
        assert_eq!((pool.size(), pool.strides()), ([3, 3], [1, 2]));
        assert!(serde_json::from_str::<MaxPool2>(r#"{"size": [0, 2], "strides": [2, 2]}"#).is_err());
        let zero_filter = r#"{
            "weight": {"v": 1, "dim": [2, 3, 0, 0], "data": []},
            "bias": null,
            "padding": [0, 0],
            "strides": [1, 1]
        }"#;
        assert!(serde_json::from_str::<Conv2>(zero_filter).is_err());
        assert!(BatchNorm2::new(
            Tensor1::zeros(1),
            Tensor1::from(vec![-1.]),
            Tensor1::ones(1),
            Tensor1::zeros(1),
            1e-5,
        )
        .is_err());
    }
}

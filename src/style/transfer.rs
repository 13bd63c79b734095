use super::{
    network::{imagenet_normalization, FeatureNetwork},
    pipeline::FeaturePipeline,
};
use crate::{
    error::StyleTransferError,
    learn::neural_network::{
        autograd::{Parameter4, Variable0},
        layer::{Forward, Normalization},
        optimizer::{Objective, Optimizer, LBFGS},
    },
    tensor::{ArcTensor0, Tensor4},
};
use anyhow::{bail, Result};
use ndarray::{ArrayView4, Ix4};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options for [`StyleTransfer`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct StyleTransferOptions {
    /// The run ends once more than `num_steps` evaluations have been performed. Default is 300.
    pub num_steps: usize,
    /// Multiplier of the style score. Default is 1_000_000.
    pub style_weight: f32,
    /// Multiplier of the content score. Default is 1.
    pub content_weight: f32,
    /// Stages followed by a content probe. Default is "conv_4".
    pub content_layers: Vec<String>,
    /// Stages followed by a style probe. Default is "conv_1" through "conv_5".
    pub style_layers: Vec<String>,
    /// A [`ProgressReport`] is created every `report_every` evaluations. Default is 50.
    pub report_every: usize,
    /// Maximum number of L-BFGS iterations per optimizer step. Default is 1.
    ///
    /// With more than 1, the number of evaluations may exceed `num_steps + 1`, up to the
    /// evaluation limit of the last step.
    pub evaluations_per_step: usize,
    /// Number of L-BFGS curvature pairs kept. Default is 100.
    pub history_size: usize,
}

impl Default for StyleTransferOptions {
    fn default() -> Self {
        Self {
            num_steps: 300,
            style_weight: 1_000_000.,
            content_weight: 1.,
            content_layers: vec!["conv_4".into()],
            style_layers: (1..=5).map(|i| format!("conv_{i}")).collect(),
            report_every: 50,
            evaluations_per_step: 1,
            history_size: 100,
        }
    }
}

impl StyleTransferOptions {
    /// Sets `num_steps`.
    pub fn with_num_steps(self, num_steps: usize) -> Self {
        Self { num_steps, ..self }
    }
    /// Sets `style_weight`.
    pub fn with_style_weight(self, style_weight: f32) -> Self {
        Self {
            style_weight,
            ..self
        }
    }
    /// Sets `content_weight`.
    pub fn with_content_weight(self, content_weight: f32) -> Self {
        Self {
            content_weight,
            ..self
        }
    }
    /// Sets `content_layers`.
    pub fn with_content_layers<S: Into<String>>(
        self,
        content_layers: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            content_layers: content_layers.into_iter().map(Into::into).collect(),
            ..self
        }
    }
    /// Sets `style_layers`.
    pub fn with_style_layers<S: Into<String>>(
        self,
        style_layers: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            style_layers: style_layers.into_iter().map(Into::into).collect(),
            ..self
        }
    }
    /// Sets `report_every`.
    pub fn with_report_every(self, report_every: usize) -> Self {
        Self {
            report_every,
            ..self
        }
    }
    /// Sets `evaluations_per_step`.
    pub fn with_evaluations_per_step(self, evaluations_per_step: usize) -> Self {
        Self {
            evaluations_per_step,
            ..self
        }
    }
    /// Sets `history_size`.
    pub fn with_history_size(self, history_size: usize) -> Self {
        Self {
            history_size,
            ..self
        }
    }
    /// Checks that the options are in range.
    ///
    /// **Errors**
    /// - The weights are not finite.
    /// - `report_every`, `evaluations_per_step` or `history_size` are 0.
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("style_weight", self.style_weight),
            ("content_weight", self.content_weight),
        ] {
            if !weight.is_finite() {
                bail!(StyleTransferError::InvalidOption(format!(
                    "{name} {weight} must be finite"
                )));
            }
        }
        for (name, value) in [
            ("report_every", self.report_every),
            ("evaluations_per_step", self.evaluations_per_step),
            ("history_size", self.history_size),
        ] {
            if value == 0 {
                bail!(StyleTransferError::InvalidOption(format!(
                    "{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// A progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProgressReport {
    /// The number of evaluations.
    pub iteration: usize,
    /// The weighted style score.
    pub style_score: f32,
    /// The weighted content score.
    pub content_score: f32,
}

/// The state of the loop, updated by each evaluation.
#[derive(Debug, Default, Clone, Copy)]
struct LoopState {
    iteration: usize,
    style_score: f32,
    content_score: f32,
    loss: f32,
}

/// Evaluates the pipeline on the image, owning the [`LoopState`].
struct Evaluation<'a> {
    pipeline: &'a FeaturePipeline,
    style_weight: f32,
    content_weight: f32,
    report_every: usize,
    state: LoopState,
    reports: Vec<ProgressReport>,
}

impl<'a> Evaluation<'a> {
    fn new(pipeline: &'a FeaturePipeline, options: &StyleTransferOptions) -> Self {
        Self {
            pipeline,
            style_weight: options.style_weight,
            content_weight: options.content_weight,
            report_every: options.report_every,
            state: LoopState::default(),
            reports: Vec::new(),
        }
    }
}

fn sum_losses(losses: impl IntoIterator<Item = Option<Variable0>>) -> Result<Variable0> {
    losses
        .into_iter()
        .try_fold(Variable0::from(ArcTensor0::zeros(())), |sum, loss| {
            let Some(loss) = loss else {
                bail!("Probe loss was not computed!");
            };
            sum.add(&loss)
        })
}

/// Projects the image into [0, 1].
fn clamp(image: &mut Parameter4) {
    image.value_view_mut().mapv_inplace(|x| x.clamp(0., 1.));
}

impl Objective<Ix4> for Evaluation<'_> {
    fn evaluate(&mut self, image: &mut Parameter4) -> Result<f32> {
        clamp(image);
        image.zero_grad();
        self.pipeline.forward(image.to_variable())?;
        let style_score = sum_losses(self.pipeline.style_losses().iter().map(|x| x.loss()))?
            .scale(self.style_weight);
        let content_score = sum_losses(self.pipeline.content_losses().iter().map(|x| x.loss()))?
            .scale(self.content_weight);
        let loss = style_score.add(&content_score)?;
        loss.backward()?;
        let state = &mut self.state;
        state.iteration += 1;
        state.style_score = style_score.scalar();
        state.content_score = content_score.scalar();
        state.loss = loss.scalar();
        if state.iteration % self.report_every == 0 {
            log::info!(
                "run {}: Style Loss: {:.4} Content Loss: {:.4}",
                state.iteration,
                state.style_score,
                state.content_score
            );
            self.reports.push(ProgressReport {
                iteration: state.iteration,
                style_score: state.style_score,
                content_score: state.content_score,
            });
        }
        Ok(state.loss)
    }
}

/// The result of [`StyleTransfer::run`].
#[derive(Debug, Clone)]
pub struct StyleTransferOutput {
    image: Tensor4,
    reports: Vec<ProgressReport>,
    iterations: usize,
    loss: f32,
}

impl StyleTransferOutput {
    /// The output image, with values in [0, 1].
    pub fn image(&self) -> &Tensor4 {
        &self.image
    }
    /// Converts into the output image.
    pub fn into_image(self) -> Tensor4 {
        self.image
    }
    /// The progress reports.
    pub fn reports(&self) -> &[ProgressReport] {
        &self.reports
    }
    /// The number of evaluations.
    pub fn iterations(&self) -> usize {
        self.iterations
    }
    /// The total loss of the last evaluation.
    pub fn loss(&self) -> f32 {
        self.loss
    }
}

/// Neural style transfer.
///
/// Optimizes an image, initially the content image, with [`LBFGS`], minimizing
/// `style_weight * style_score + content_weight * content_score` where the scores are the
/// sums of the losses recorded by the probes of a [`FeaturePipeline`].
///
/// The image is clamped into [0, 1] before each evaluation and after the last one.
#[derive(Debug, Clone)]
pub struct StyleTransfer {
    network: FeatureNetwork,
    normalization: Option<Normalization>,
    options: StyleTransferOptions,
}

impl StyleTransfer {
    /// Creates a new [`StyleTransfer`] with `network`.
    ///
    /// The images are normalized with the ImageNet mean and standard deviation.
    pub fn new(network: FeatureNetwork) -> Self {
        Self {
            network,
            normalization: None,
            options: StyleTransferOptions::default(),
        }
    }
    /// Normalizes images with `normalization`.
    pub fn with_normalization(self, normalization: Normalization) -> Self {
        Self {
            normalization: Some(normalization),
            ..self
        }
    }
    /// Sets the options.
    pub fn with_options(self, options: StyleTransferOptions) -> Self {
        Self { options, ..self }
    }
    /// The options.
    pub fn options(&self) -> &StyleTransferOptions {
        &self.options
    }
    /// Builds the pipeline for `content` and `style`.
    ///
    /// See [`PipelineBuilder::build`](super::pipeline::builder::PipelineBuilder::build).
    pub fn build_pipeline(
        &self,
        content: ArrayView4<f32>,
        style: ArrayView4<f32>,
    ) -> Result<FeaturePipeline> {
        let normalization = match self.normalization.as_ref() {
            Some(normalization) => normalization.clone(),
            None => imagenet_normalization()?,
        };
        FeaturePipeline::builder(self.network.clone(), normalization)
            .content_layers(self.options.content_layers.iter().cloned())
            .style_layers(self.options.style_layers.iter().cloned())
            .build(content, style)
    }
    /// Runs style transfer, starting from the content image.
    ///
    /// **Errors**
    /// - The options are invalid.
    /// - The pipeline can not be built, see [`.build_pipeline()`](Self::build_pipeline).
    /// - The pipeline has no probes.
    pub fn run(
        &self,
        content: ArrayView4<f32>,
        style: ArrayView4<f32>,
    ) -> Result<StyleTransferOutput> {
        self.run_with_input(content, style, content)
    }
    /// Runs style transfer, starting from `input`.
    ///
    /// See [`.run()`](Self::run).
    pub fn run_with_input(
        &self,
        content: ArrayView4<f32>,
        style: ArrayView4<f32>,
        input: ArrayView4<f32>,
    ) -> Result<StyleTransferOutput> {
        let options = &self.options;
        options.validate()?;
        if input.shape() != content.shape() {
            bail!(StyleTransferError::shape_mismatch(
                content.shape(),
                input.shape()
            ));
        }
        log::info!("Building the style transfer model");
        let pipeline = self.build_pipeline(content, style)?;
        if pipeline.content_losses().is_empty() && pipeline.style_losses().is_empty() {
            bail!(StyleTransferError::InvalidOption(format!(
                "no stage matches content_layers {:?} or style_layers {:?}",
                options.content_layers, options.style_layers
            )));
        }
        let mut image = Parameter4::from(input.to_owned());
        image.set_training(true);
        let mut optimizer = LBFGS::builder()
            .max_iter(options.evaluations_per_step)
            .history_size(options.history_size)
            .build()?;
        let mut evaluation = Evaluation::new(&pipeline, options);
        log::info!("Optimizing");
        while evaluation.state.iteration <= options.num_steps {
            optimizer.step(&mut image, &mut evaluation)?;
        }
        clamp(&mut image);
        let Evaluation { state, reports, .. } = evaluation;
        Ok(StyleTransferOutput {
            image: image.into_value().into_owned(),
            reports,
            iterations: state.iteration,
            loss: state.loss,
        })
    }
}

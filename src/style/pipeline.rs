use super::{
    network::{FeatureNetwork, NetworkStage},
    probe::{ContentLoss, StyleLoss},
};
use crate::{
    error::StyleTransferError,
    learn::neural_network::{
        autograd::Variable4,
        layer::{BatchNorm2, Conv2, Forward, MaxPool2, Normalization, Relu},
    },
};
use anyhow::{bail, Result};
use ndarray::ArrayView4;
use std::{collections::HashSet, sync::Arc};

/// Pipeline builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`FeaturePipeline`].
    ///
    /// Rebuilds a [`FeatureNetwork`] into a pipeline, inserting probes after the named stages.
    #[derive(Debug, Clone)]
    pub struct PipelineBuilder {
        network: FeatureNetwork,
        normalization: Normalization,
        content_layers: Vec<String>,
        style_layers: Vec<String>,
    }

    impl PipelineBuilder {
        pub(super) fn new(network: FeatureNetwork, normalization: Normalization) -> Self {
            Self {
                network,
                normalization,
                content_layers: Vec::new(),
                style_layers: Vec::new(),
            }
        }
        /// Stages followed by a [`ContentLoss`].
        pub fn content_layers<S: Into<String>>(
            self,
            content_layers: impl IntoIterator<Item = S>,
        ) -> Self {
            Self {
                content_layers: content_layers.into_iter().map(Into::into).collect(),
                ..self
            }
        }
        /// Stages followed by a [`StyleLoss`].
        pub fn style_layers<S: Into<String>>(
            self,
            style_layers: impl IntoIterator<Item = S>,
        ) -> Self {
            Self {
                style_layers: style_layers.into_iter().map(Into::into).collect(),
                ..self
            }
        }
        /// Builds the pipeline.
        ///
        /// The targets of the probes are the activations of `content` and `style` at each
        /// probe. Relus are rebuilt to not be inplace. The pipeline ends with its last probe.
        ///
        /// Layer names that don't occur in the network are ignored.
        ///
        /// **Errors**
        /// - The content and style images have different shapes.
        /// - The number of channels of the images doesn't match the normalization.
        /// - The network has a stage with an unrecognized kind.
        /// - A stage fails on the images.
        pub fn build(self, content: ArrayView4<f32>, style: ArrayView4<f32>) -> Result<FeaturePipeline> {
            let Self {
                network,
                normalization,
                content_layers,
                style_layers,
            } = self;
            if content.shape() != style.shape() {
                bail!(StyleTransferError::ImageShapeMismatch {
                    content: content.shape().to_vec(),
                    style: style.shape().to_vec(),
                });
            }
            let channels = content.shape()[1];
            if channels != normalization.channels() {
                bail!(StyleTransferError::ChannelMismatch {
                    expected: normalization.channels(),
                    found: channels,
                });
            }
            let content_layers: HashSet<String> = content_layers.into_iter().collect();
            let style_layers: HashSet<String> = style_layers.into_iter().collect();
            let named_stages = name_stages(network.stages())?;
            let last_content = named_stages
                .iter()
                .rposition(|(name, _)| content_layers.contains(name));
            let last_style = named_stages
                .iter()
                .rposition(|(name, _)| style_layers.contains(name));
            let len = last_content.max(last_style).map_or(0, |i| i + 1);
            let mut content = Some(Variable4::from(content.to_owned()).forward(&normalization)?);
            let mut style = Some(Variable4::from(style.to_owned()).forward(&normalization)?);
            let mut stages = Vec::with_capacity(len + content_layers.len() + style_layers.len() + 1);
            stages.push(("normalization".to_string(), Stage::Normalization(normalization)));
            let mut content_losses = Vec::new();
            let mut style_losses = Vec::new();
            for (i, (name, stage)) in named_stages.into_iter().take(len).enumerate() {
                let index = name[name.rfind('_').map_or(0, |x| x + 1)..].to_string();
                content = content
                    .filter(|_| last_content.map_or(false, |last| i <= last))
                    .map(|x| x.forward(&stage))
                    .transpose()?;
                style = style
                    .filter(|_| last_style.map_or(false, |last| i <= last))
                    .map(|x| x.forward(&stage))
                    .transpose()?;
                log::debug!("{name}");
                let is_content_layer = content_layers.contains(&name);
                let is_style_layer = style_layers.contains(&name);
                stages.push((name, stage));
                if is_content_layer {
                    if let Some(content) = content.as_ref() {
                        let probe = Arc::new(ContentLoss::new(content));
                        let name = format!("content_loss_{index}");
                        log::debug!("{name}: {:?}", content.shape());
                        stages.push((name, Stage::ContentLoss(probe.clone())));
                        content_losses.push(probe);
                    }
                }
                if is_style_layer {
                    if let Some(style) = style.as_ref() {
                        let probe = Arc::new(StyleLoss::new(style)?);
                        let name = format!("style_loss_{index}");
                        log::debug!("{name}: {:?}", style.shape());
                        stages.push((name, Stage::StyleLoss(probe.clone())));
                        style_losses.push(probe);
                    }
                }
            }
            Ok(FeaturePipeline {
                stages,
                content_losses,
                style_losses,
            })
        }
    }
}
use builder::PipelineBuilder;

/// Names the stages of `network` with the index of the last convolution.
///
/// **Errors**
/// A stage has an unrecognized kind.
fn name_stages(stages: &[NetworkStage]) -> Result<Vec<(String, Stage)>> {
    let mut i = 0;
    stages
        .iter()
        .map(|stage| {
            let named = match stage {
                NetworkStage::Conv2(conv) => {
                    i += 1;
                    (format!("conv_{i}"), Stage::Conv2(conv.clone()))
                }
                NetworkStage::Relu(relu) => {
                    (format!("relu_{i}"), Stage::Relu(relu.with_inplace(false)))
                }
                NetworkStage::MaxPool2(pool) => (format!("maxpool_{i}"), Stage::MaxPool2(*pool)),
                NetworkStage::BatchNorm2(bn) => (format!("bn_{i}"), Stage::BatchNorm2(bn.clone())),
                NetworkStage::Other { kind } => {
                    bail!(StyleTransferError::UnrecognizedLayer { kind: kind.clone() })
                }
            };
            Ok(named)
        })
        .collect()
}

/// A stage of a [`FeaturePipeline`].
#[derive(Debug, Clone)]
pub enum Stage {
    /// Per channel normalization of the input image.
    Normalization(Normalization),
    /// Convolution.
    Conv2(Conv2),
    /// Activation.
    Relu(Relu),
    /// Pooling.
    MaxPool2(MaxPool2),
    /// Batch normalization.
    BatchNorm2(BatchNorm2),
    /// Content loss probe.
    ContentLoss(Arc<ContentLoss>),
    /// Style loss probe.
    StyleLoss(Arc<StyleLoss>),
}

impl Stage {
    /// Whether the stage is a [`ContentLoss`] or a [`StyleLoss`].
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::ContentLoss(_) | Self::StyleLoss(_))
    }
}

impl Forward<Variable4> for Stage {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        match self {
            Self::Normalization(x) => x.forward(input),
            Self::Conv2(x) => x.forward(input),
            Self::Relu(x) => x.forward(input),
            Self::MaxPool2(x) => x.forward(input),
            Self::BatchNorm2(x) => x.forward(input),
            Self::ContentLoss(x) => x.forward(input),
            Self::StyleLoss(x) => x.forward(input),
        }
    }
}

/// Feature pipeline.
///
/// A normalization, the stages of a [`FeatureNetwork`] and the probes inserted after them,
/// ending with the last probe. The forward pass records the loss of each probe.
///
/// Clones share the probes, concurrent forward passes overwrite each other's losses.
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    stages: Vec<(String, Stage)>,
    content_losses: Vec<Arc<ContentLoss>>,
    style_losses: Vec<Arc<StyleLoss>>,
}

impl FeaturePipeline {
    /// A builder for creating a [`FeaturePipeline`] from `network`.
    ///
    /// The pipeline starts with `normalization`.
    pub fn builder(network: FeatureNetwork, normalization: Normalization) -> PipelineBuilder {
        PipelineBuilder::new(network, normalization)
    }
    /// The number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }
    /// Whether there are no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
    /// The stage names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.stages.iter().map(|(name, _)| name.as_str())
    }
    /// The named stages in order.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &Stage)> + '_ {
        self.stages.iter().map(|(name, stage)| (name.as_str(), stage))
    }
    /// The content probes in order.
    pub fn content_losses(&self) -> &[Arc<ContentLoss>] {
        &self.content_losses
    }
    /// The style probes in order.
    pub fn style_losses(&self) -> &[Arc<StyleLoss>] {
        &self.style_losses
    }
}

impl Forward<Variable4> for FeaturePipeline {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        self.stages
            .iter()
            .try_fold(input, |x, (_, stage)| stage.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        learn::neural_network::layer::random_tensor4,
        style::network::{imagenet_normalization, NetworkStage},
        tensor::Tensor4,
    };

    fn network() -> FeatureNetwork {
        FeatureNetwork::vgg_random(&[Some(4), Some(4), None, Some(6), None, Some(8), None], 0)
            .unwrap()
    }

    fn image(seed: u64) -> Tensor4 {
        random_tensor4([1, 3, 16, 16], seed).mapv(|x| 0.5 + 0.5 * x)
    }

    fn build(
        network: FeatureNetwork,
        content_layers: &[&str],
        style_layers: &[&str],
    ) -> Result<FeaturePipeline> {
        let (content, style) = (image(0), image(1));
        FeaturePipeline::builder(network, imagenet_normalization()?)
            .content_layers(content_layers.iter().copied())
            .style_layers(style_layers.iter().copied())
            .build(content.view(), style.view())
    }

    #[test]
    fn pipeline_names() {
        let pipeline = build(network(), &["conv_2"], &["conv_1", "relu_3"]).unwrap();
        let names: Vec<_> = pipeline.names().collect();
        assert_eq!(
            names,
            [
                "normalization",
                "conv_1",
                "style_loss_1",
                "relu_1",
                "conv_2",
                "content_loss_2",
                "relu_2",
                "maxpool_2",
                "conv_3",
                "relu_3",
                "style_loss_3",
            ]
        );
        assert_eq!(pipeline.content_losses().len(), 1);
        assert_eq!(pipeline.style_losses().len(), 2);
        assert!(pipeline
            .stages()
            .all(|(_, stage)| !matches!(stage, Stage::Relu(relu) if relu.is_inplace())));
    }

    #[test]
    fn pipeline_content_and_style_at_same_stage() {
        let pipeline = build(network(), &["conv_1"], &["conv_1"]).unwrap();
        let names: Vec<_> = pipeline.names().collect();
        assert_eq!(
            names,
            ["normalization", "conv_1", "content_loss_1", "style_loss_1"]
        );
    }

    #[test]
    fn pipeline_truncated_at_last_probe() {
        let pipeline = build(network(), &["conv_4"], &["relu_1", "conv_2"]).unwrap();
        let (_, last) = pipeline.stages().last().unwrap();
        assert!(last.is_probe());
        assert_eq!(pipeline.names().last(), Some("content_loss_4"));
        let pipeline = build(network(), &["relu_1"], &["conv_1"]).unwrap();
        assert_eq!(pipeline.len(), 5);
        assert_eq!(pipeline.names().last(), Some("content_loss_1"));
    }

    #[test]
    fn pipeline_without_probes() {
        let pipeline = build(network(), &["conv_9"], &[]).unwrap();
        assert_eq!(pipeline.names().collect::<Vec<_>>(), ["normalization"]);
        assert!(pipeline.content_losses().is_empty());
    }

    #[test]
    fn pipeline_unrecognized_layer() {
        let network = network();
        let stages = network
            .stages()
            .iter()
            .cloned()
            .chain([NetworkStage::Other {
                kind: "Dropout".into(),
            }]);
        let error = build(FeatureNetwork::from_stages(stages), &["conv_1"], &[]).unwrap_err();
        assert_eq!(
            error.downcast_ref::<StyleTransferError>(),
            Some(&StyleTransferError::UnrecognizedLayer {
                kind: "Dropout".into()
            })
        );
    }

    #[test]
    fn pipeline_image_shape_mismatch() {
        let content = image(0);
        let style = Tensor4::zeros([1, 3, 16, 8]);
        let error = FeaturePipeline::builder(network(), imagenet_normalization().unwrap())
            .content_layers(["conv_1"])
            .build(content.view(), style.view())
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<StyleTransferError>(),
            Some(StyleTransferError::ImageShapeMismatch { .. })
        ));
    }

    #[test]
    fn pipeline_channel_mismatch() {
        let content = Tensor4::zeros([1, 1, 16, 16]);
        let error = FeaturePipeline::builder(network(), imagenet_normalization().unwrap())
            .build(content.view(), content.view())
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<StyleTransferError>(),
            Some(StyleTransferError::ChannelMismatch {
                expected: 3,
                found: 1
            })
        ));
    }

    #[test]
    fn pipeline_targets_match_forward() {
        let (content, style) = (image(0), image(1));
        let pipeline = FeaturePipeline::builder(network(), imagenet_normalization().unwrap())
            .content_layers(["relu_3"])
            .style_layers(["conv_2", "conv_3"])
            .build(content.view(), style.view())
            .unwrap();
        // At the content image, the content loss is 0.
        let output = pipeline.forward(Variable4::from(content.clone())).unwrap();
        assert_eq!(output.shape(), &[1, 6, 8, 8]);
        assert!(pipeline.content_losses()[0].loss().unwrap().scalar() < 1e-10);
        assert!(pipeline.style_losses()[0].loss().unwrap().scalar() > 0.);
        // At the style image, the style losses are 0.
        pipeline.forward(Variable4::from(style)).unwrap();
        for probe in pipeline.style_losses() {
            assert!(probe.loss().unwrap().scalar() < 1e-10);
        }
        assert!(pipeline.content_losses()[0].loss().unwrap().scalar() > 0.);
    }

    #[test]
    fn pipeline_passthrough() {
        let content = image(0);
        let pipeline = FeaturePipeline::builder(network(), imagenet_normalization().unwrap())
            .content_layers(["conv_2"])
            .style_layers(["conv_2"])
            .build(content.view(), content.view())
            .unwrap();
        let x = Variable4::from(image(2));
        let y = pipeline.forward(x.clone()).unwrap();
        let expected = pipeline
            .stages()
            .filter(|(_, stage)| !stage.is_probe())
            .try_fold(x, |x, (_, stage)| stage.forward(x))
            .unwrap();
        assert_eq!(y.value(), expected.value());
    }
}

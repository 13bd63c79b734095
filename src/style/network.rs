use crate::{
    learn::neural_network::layer::{BatchNorm2, Conv2, Layer, MaxPool2, Normalization, Relu},
    tensor::Tensor1,
};
use anyhow::Result;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// ImageNet per channel mean, for networks trained on ImageNet.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet per channel standard deviation, for networks trained on ImageNet.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Normalization with [`IMAGENET_MEAN`] and [`IMAGENET_STD`].
pub fn imagenet_normalization() -> Result<Normalization> {
    Normalization::new(
        Tensor1::from(IMAGENET_MEAN.to_vec()),
        Tensor1::from(IMAGENET_STD.to_vec()),
    )
}

/// Output channels of the convolutions of VGG-19, `None` is a max pool.
pub const VGG19_LAYOUT: &[Option<usize>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// A stage of a [`FeatureNetwork`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NetworkStage {
    /// Convolution.
    Conv2(Conv2),
    /// Activation.
    Relu(Relu),
    /// Pooling.
    MaxPool2(MaxPool2),
    /// Batch normalization.
    BatchNorm2(BatchNorm2),
    /// A stage that can't be evaluated, ie from a foreign network description.
    Other {
        /// The kind of stage.
        kind: String,
    },
}

impl NetworkStage {
    /// The kind of stage.
    pub fn kind(&self) -> &str {
        match self {
            Self::Conv2(_) => "Conv2",
            Self::Relu(_) => "Relu",
            Self::MaxPool2(_) => "MaxPool2",
            Self::BatchNorm2(_) => "BatchNorm2",
            Self::Other { kind } => kind,
        }
    }
    fn parameter_count(&self) -> usize {
        match self {
            Self::Conv2(conv) => conv.parameter_count(),
            Self::BatchNorm2(bn) => bn.parameter_count(),
            Self::Relu(_) | Self::MaxPool2(_) | Self::Other { .. } => 0,
        }
    }
}

impl From<Conv2> for NetworkStage {
    fn from(conv: Conv2) -> Self {
        Self::Conv2(conv)
    }
}

impl From<Relu> for NetworkStage {
    fn from(relu: Relu) -> Self {
        Self::Relu(relu)
    }
}

impl From<MaxPool2> for NetworkStage {
    fn from(pool: MaxPool2) -> Self {
        Self::MaxPool2(pool)
    }
}

impl From<BatchNorm2> for NetworkStage {
    fn from(bn: BatchNorm2) -> Self {
        Self::BatchNorm2(bn)
    }
}

/// A frozen feature extraction network.
///
/// Clones share the stages, so a network loaded once can be reused by every run.
///
/// With feature "serde", networks can be serialized, for example to load pretrained weights
/// converted from another framework.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureNetwork {
    stages: Arc<[NetworkStage]>,
}

impl FeatureNetwork {
    /// Creates a network from `stages`.
    pub fn from_stages(stages: impl IntoIterator<Item = NetworkStage>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }
    /// The stages.
    pub fn stages(&self) -> &[NetworkStage] {
        &self.stages
    }
    /// The number of elements of the weights.
    pub fn parameter_count(&self) -> usize {
        self.stages.iter().map(NetworkStage::parameter_count).sum()
    }
    /// A VGG style network with random weights.
    ///
    /// Each `Some(outputs)` is a 3x3 convolution with padding 1 followed by an inplace [`Relu`],
    /// each `None` is a 2x2 [`MaxPool2`]. The input has 3 channels.
    ///
    /// The convolution with index `i` is initialized with seed `seed + i`.
    ///
    /// **Errors**
    /// A convolution has 0 outputs.
    pub fn vgg_random(layout: &[Option<usize>], seed: u64) -> Result<Self> {
        let mut stages: Vec<NetworkStage> = Vec::with_capacity(2 * layout.len());
        let mut inputs = 3;
        for (i, outputs) in layout.iter().enumerate() {
            if let Some(outputs) = *outputs {
                let conv = Conv2::builder()
                    .inputs(inputs)
                    .outputs(outputs)
                    .filter([3, 3])
                    .padding([1, 1])
                    .bias(true)
                    .seed(seed.wrapping_add(i as u64))
                    .build()?;
                stages.push(conv.into());
                stages.push(Relu::inplace().into());
                inputs = outputs;
            } else {
                stages.push(MaxPool2::builder().size([2, 2]).strides([2, 2]).build()?.into());
            }
        }
        Ok(Self::from_stages(stages))
    }
    /// VGG-19 with random weights.
    ///
    /// See [`.vgg_random()`](Self::vgg_random).
    pub fn vgg19_random(seed: u64) -> Result<Self> {
        Self::vgg_random(VGG19_LAYOUT, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vgg19_layout() {
        let network = FeatureNetwork::vgg19_random(0).unwrap();
        let stages = network.stages();
        assert_eq!(stages.len(), 16 * 2 + 5);
        assert_eq!(
            stages.iter().filter(|x| matches!(x, NetworkStage::Conv2(_))).count(),
            16
        );
        assert!(matches!(&stages[1], NetworkStage::Relu(relu) if relu.is_inplace()));
        assert_eq!(stages[4].kind(), "MaxPool2");
        // 20_024_384 weights and biases in the convolutions of vgg19.
        assert_eq!(network.parameter_count(), 20_024_384);
    }

    #[test]
    fn clones_share_stages() {
        let network = FeatureNetwork::vgg_random(&[Some(4), None], 1).unwrap();
        let clone = network.clone();
        assert!(std::ptr::eq(network.stages(), clone.stages()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn network_serde() {
        let network = FeatureNetwork::from_stages([
            NetworkStage::from(
                Conv2::builder()
                    .inputs(3)
                    .outputs(2)
                    .seed(0)
                    .build()
                    .unwrap(),
            ),
            Relu::default().into(),
            NetworkStage::Other {
                kind: "Dropout".into(),
            },
        ]);
        let json = serde_json::to_string(&network).unwrap();
        let network2: FeatureNetwork = serde_json::from_str(&json).unwrap();
        assert_eq!(network2.stages().len(), 3);
        assert_eq!(network2.stages()[2].kind(), "Dropout");
        let (NetworkStage::Conv2(a), NetworkStage::Conv2(b)) =
            (&network.stages()[0], &network2.stages()[0])
        else {
            panic!("expected Conv2");
        };
        assert_eq!(a.weight(), b.weight());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn network_deserialize_checks_layers() {
        let network = FeatureNetwork::from_stages([
            NetworkStage::from(
                Conv2::builder()
                    .inputs(3)
                    .outputs(2)
                    .bias(true)
                    .seed(0)
                    .build()
                    .unwrap(),
            ),
            MaxPool2::builder().build().unwrap().into(),
            BatchNorm2::identity(2).into(),
        ]);
        let json = serde_json::to_value(&network).unwrap();
        serde_json::from_value::<FeatureNetwork>(json.clone()).unwrap();

        let mut zero_strides = json.clone();
        zero_strides["stages"][1]["MaxPool2"]["strides"] = serde_json::json!([0, 0]);
        assert!(serde_json::from_value::<FeatureNetwork>(zero_strides).is_err());

        let mut bias_len = json.clone();
        bias_len["stages"][0]["Conv2"]["bias"] =
            serde_json::json!({"v": 1, "dim": [3], "data": [0., 0., 0.]});
        assert!(serde_json::from_value::<FeatureNetwork>(bias_len).is_err());

        let mut negative_var = json;
        negative_var["stages"][2]["BatchNorm2"]["running_var"] =
            serde_json::json!({"v": 1, "dim": [2], "data": [1., -1.]});
        assert!(serde_json::from_value::<FeatureNetwork>(negative_var).is_err());
    }

    #[test]
    fn imagenet() {
        let normalization = imagenet_normalization().unwrap();
        assert_eq!(normalization.channels(), 3);
    }
}

use thiserror::Error;

/// Style transfer errors.
///
/// Functions return [`anyhow::Result`], these can be recovered with
/// [`downcast_ref`](anyhow::Error::downcast_ref).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StyleTransferError {
    /// The network contains a stage that can not be rebuilt into a pipeline.
    #[error("Unrecognized layer: {kind}!")]
    UnrecognizedLayer {
        /// The kind of the stage.
        kind: String,
    },
    /// A tensor did not have the expected shape.
    #[error("Expected shape {expected:?}, found {found:?}!")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The shape found.
        found: Vec<usize>,
    },
    /// The content and style images have different shapes.
    #[error("Content image {content:?} and style image {style:?} must have the same shape!")]
    ImageShapeMismatch {
        /// Shape of the content image.
        content: Vec<usize>,
        /// Shape of the style image.
        style: Vec<usize>,
    },
    /// Per channel constants do not match the channels of the input.
    #[error("Expected {expected} channels, found {found}!")]
    ChannelMismatch {
        /// The number of channels of the constants.
        expected: usize,
        /// The number of channels of the input.
        found: usize,
    },
    /// An option is out of range.
    #[error("Invalid option: {0}!")]
    InvalidOption(String),
}

impl StyleTransferError {
    pub(crate) fn shape_mismatch(expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

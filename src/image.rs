use crate::{error::StyleTransferError, tensor::Tensor4};
use anyhow::{bail, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array3, ArrayView4, Axis};
use std::path::Path;

/// Loads an RGB image as a `[1, 3, height, width]` tensor with values in [0, 1].
///
/// If `size` is `[height, width]`, the image is resized with a triangle (bilinear) filter.
pub fn load_image(path: impl AsRef<Path>, size: Option<[usize; 2]>) -> Result<Tensor4> {
    let path = path.as_ref();
    let mut image = image::open(path)?;
    if let Some([height, width]) = size {
        image = image.resize_exact(width.try_into()?, height.try_into()?, FilterType::Triangle);
    }
    let image = image.into_rgb32f();
    let (width, height) = image.dimensions();
    log::debug!("loaded {path:?} [{height}, {width}]");
    let pixels = Array3::from_shape_vec([height as usize, width as usize, 3], image.into_raw())?;
    Ok(pixels
        .permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned())
}

/// Saves a `[1, 3, height, width]` tensor as an RGB image.
///
/// Values are clamped into [0, 1]. The format is determined by the extension of `path`.
pub fn save_image(image: ArrayView4<f32>, path: impl AsRef<Path>) -> Result<()> {
    let (batch_size, channels, height, width) = image.dim();
    if batch_size != 1 || channels != 3 {
        bail!(StyleTransferError::shape_mismatch(
            &[1, 3, height, width],
            image.shape()
        ));
    }
    let to_u8 = |x: f32| (x.clamp(0., 1.) * 255.).round() as u8;
    let output = RgbImage::from_fn(width.try_into()?, height.try_into()?, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([0, 1, 2].map(|c| to_u8(image[(0, c, y, x)])))
    });
    output.save(path)?;
    Ok(())
}

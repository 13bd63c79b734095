use ndarray::{
    ArcArray, Array, ArrayBase, ArrayView4, Axis, DataOwned, Dimension, Ix0, Ix1, Ix2, Ix3, Ix4, IxDyn,
};

/// Tensor.
pub type Tensor<D> = Array<f32, D>;
/// Tensor with 1 element.
pub type Tensor0 = Tensor<Ix0>;
/// Tensor with 1 dimension.
pub type Tensor1 = Tensor<Ix1>;
/// Tensor with 2 dimensions.
pub type Tensor2 = Tensor<Ix2>;
/// Tensor with 3 dimensions.
pub type Tensor3 = Tensor<Ix3>;
/// Tensor with 4 dimensions.
///
/// Images and feature maps are `[batch, channels, height, width]`.
pub type Tensor4 = Tensor<Ix4>;
/// Tensor with dynamic dimensions.
pub type TensorD = Tensor<IxDyn>;

/// Shared tensor.
///
/// Clones are cheap, mutation copies the data if it is not exclusive.
pub type ArcTensor<D> = ArcArray<f32, D>;
/// Shared tensor with 1 element.
pub type ArcTensor0 = ArcTensor<Ix0>;
/// Shared tensor with 1 dimension.
pub type ArcTensor1 = ArcTensor<Ix1>;
/// Shared tensor with 2 dimensions.
pub type ArcTensor2 = ArcTensor<Ix2>;
/// Shared tensor with 3 dimensions.
pub type ArcTensor3 = ArcTensor<Ix3>;
/// Shared tensor with 4 dimensions.
pub type ArcTensor4 = ArcTensor<Ix4>;
/// Shared tensor with dynamic dimensions.
pub type ArcTensorD = ArcTensor<IxDyn>;

/// Converts `array` into a shared tensor in standard layout.
///
/// Does not copy if `array` is already standard layout.
pub fn into_standard_layout<S, D>(array: ArrayBase<S, D>) -> ArcTensor<D>
where
    S: DataOwned<Elem = f32>,
    D: Dimension,
{
    if array.is_standard_layout() {
        array.into_shared()
    } else {
        array.as_standard_layout().into_owned().into_shared()
    }
}

/// Per channel values broadcast to `[1, channels, 1, 1]`.
pub(crate) fn channel_broadcast(values: &ArcTensor1) -> ArrayView4<f32> {
    values
        .view()
        .insert_axis(Axis(0))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

use super::Conv2Options;
use crate::tensor::{Tensor3, Tensor4};
use anyhow::Result;
use ndarray::{
    linalg::general_mat_mul, ArrayView1, ArrayView3, ArrayView4, ArrayViewMut3, Axis, Zip,
};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

/// Input row of output row `o` and filter row `f`, None if it falls in the padding.
fn input_index(o: usize, f: usize, stride: usize, padding: usize, len: usize) -> Option<usize> {
    (o * stride + f)
        .checked_sub(padding)
        .filter(|i| *i < len)
}

fn im2col(x: ArrayView3<f32>, options: &Conv2Options, [oh, ow]: [usize; 2]) -> Tensor3 {
    let (c, ih, iw) = x.dim();
    let [fh, fw] = options.filter;
    let [ph, pw] = options.padding;
    let [sh, sw] = options.strides;
    let mut cols = Tensor3::zeros([c, fh * fw, oh * ow]);
    Zip::from(cols.axis_iter_mut(Axis(0)))
        .and(x.axis_iter(Axis(0)))
        .par_for_each(|mut cols, x| {
            for fi in 0..fh {
                for fj in 0..fw {
                    let mut row = cols.row_mut(fi * fw + fj);
                    for oi in 0..oh {
                        let Some(i) = input_index(oi, fi, sh, ph, ih) else {
                            continue;
                        };
                        for oj in 0..ow {
                            if let Some(j) = input_index(oj, fj, sw, pw, iw) {
                                row[oi * ow + oj] = x[(i, j)];
                            }
                        }
                    }
                }
            }
        });
    cols
}

fn col2im(
    cols: ArrayView3<f32>,
    mut x: ArrayViewMut3<f32>,
    options: &Conv2Options,
    [oh, ow]: [usize; 2],
) {
    let (_c, ih, iw) = x.dim();
    let [fh, fw] = options.filter;
    let [ph, pw] = options.padding;
    let [sh, sw] = options.strides;
    Zip::from(x.axis_iter_mut(Axis(0)))
        .and(cols.axis_iter(Axis(0)))
        .par_for_each(|mut x, cols| {
            for fi in 0..fh {
                for fj in 0..fw {
                    let row = cols.row(fi * fw + fj);
                    for oi in 0..oh {
                        let Some(i) = input_index(oi, fi, sh, ph, ih) else {
                            continue;
                        };
                        for oj in 0..ow {
                            if let Some(j) = input_index(oj, fj, sw, pw, iw) {
                                x[(i, j)] += row[oi * ow + oj];
                            }
                        }
                    }
                }
            }
        });
}

pub(super) fn conv2_im2col_forward(
    input: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    options: &Conv2Options,
) -> Result<Tensor4> {
    let (bs, ic, ih, iw) = input.dim();
    let (oc, _ic, fh, fw) = weight.dim();
    debug_assert_eq!(ic, _ic);
    let [oh, ow] = options.output_shape([ih, iw])?;
    let weight = weight.as_standard_layout();
    let weight = weight.view().into_shape([oc, ic * fh * fw])?;
    let mut output = Tensor4::zeros([bs, oc, oh, ow]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(input.axis_iter(Axis(0)))
        .try_for_each(|(y, x)| -> Result<()> {
            let cols = im2col(x, options, [oh, ow]).into_shape([ic * fh * fw, oh * ow])?;
            let mut y = y.into_shape([oc, oh * ow])?;
            general_mat_mul(1., &weight, &cols, 0., &mut y);
            if let Some(bias) = bias.as_ref() {
                y += &bias.view().insert_axis(Axis(1));
            }
            Ok(())
        })?;
    Ok(output)
}

pub(super) fn conv2_im2col_backward_input(
    output_grad: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    input_dim: [usize; 4],
    options: &Conv2Options,
) -> Result<Tensor4> {
    let (_bs, oc, oh, ow) = output_grad.dim();
    let (_oc, ic, fh, fw) = weight.dim();
    debug_assert_eq!(oc, _oc);
    let weight = weight.as_standard_layout();
    let weight = weight.view().into_shape([oc, ic * fh * fw])?;
    let mut input_grad = Tensor4::zeros(input_dim);
    input_grad
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(output_grad.axis_iter(Axis(0)))
        .try_for_each(|(dx, dy)| -> Result<()> {
            let dy = dy.as_standard_layout();
            let dy = dy.view().into_shape([oc, oh * ow])?;
            let dcols = weight.t().dot(&dy).into_shape([ic, fh * fw, oh * ow])?;
            col2im(dcols.view(), dx, options, [oh, ow]);
            Ok(())
        })?;
    Ok(input_grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn conv2_naive(input: ArrayView4<f32>, weight: ArrayView4<f32>, options: &Conv2Options) -> Tensor4 {
        let (bs, ic, ih, iw) = input.dim();
        let (oc, _, fh, fw) = weight.dim();
        let [oh, ow] = options.output_shape([ih, iw]).unwrap();
        let [ph, pw] = options.padding;
        let [sh, sw] = options.strides;
        let mut output = Tensor4::zeros([bs, oc, oh, ow]);
        for b in 0..bs {
            for o in 0..oc {
                for oi in 0..oh {
                    for oj in 0..ow {
                        let mut acc = 0.;
                        for c in 0..ic {
                            for fi in 0..fh {
                                for fj in 0..fw {
                                    let i = (oi * sh + fi) as isize - ph as isize;
                                    let j = (oj * sw + fj) as isize - pw as isize;
                                    if i >= 0 && j >= 0 && (i as usize) < ih && (j as usize) < iw {
                                        acc += input[(b, c, i as usize, j as usize)]
                                            * weight[(o, c, fi, fj)];
                                    }
                                }
                            }
                        }
                        output[(b, o, oi, oj)] = acc;
                    }
                }
            }
        }
        output
    }

    fn arange4(dim: [usize; 4], scale: f32) -> Tensor4 {
        let len = dim.iter().product();
        Tensor4::from_shape_vec(dim, (0..len).map(|x| ((x % 7) as f32 - 3.) * scale).collect())
            .unwrap()
    }

    #[test]
    fn forward_matches_naive() {
        for (padding, strides) in [([0, 0], [1, 1]), ([1, 1], [1, 1]), ([1, 0], [2, 2])] {
            let options = Conv2Options {
                filter: [3, 3],
                padding,
                strides,
            };
            let x = arange4([2, 3, 6, 5], 0.1);
            let w = arange4([4, 3, 3, 3], 0.2);
            let y = conv2_im2col_forward(x.view(), w.view(), None, &options).unwrap();
            let expected = conv2_naive(x.view(), w.view(), &options);
            assert_eq!(y.shape(), expected.shape());
            for (y, e) in y.iter().zip(expected.iter()) {
                assert_relative_eq!(*y, *e, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn backward_input_is_adjoint() {
        // <conv(x), dy> == <x, conv_backward(dy)>
        let options = Conv2Options {
            filter: [3, 3],
            padding: [1, 1],
            strides: [2, 1],
        };
        let x = arange4([1, 2, 5, 4], 0.3);
        let w = arange4([3, 2, 3, 3], 0.1);
        let y = conv2_im2col_forward(x.view(), w.view(), None, &options).unwrap();
        let dy = arange4([1, 3, y.shape()[2], y.shape()[3]], 0.5);
        let dx =
            conv2_im2col_backward_input(dy.view(), w.view(), [1, 2, 5, 4], &options).unwrap();
        let lhs: f32 = (&y * &dy).sum();
        let rhs: f32 = (&x * &dx).sum();
        assert_relative_eq!(lhs, rhs, max_relative = 1e-4);
    }
}

// src/ops/convolution.rs
use crate::autograd::{is_no_grad, Tensor};
use ndarray::{s, Array, Array2, Array3, ArrayD, ArrayView3, Axis, Ix1, Ix4, Zip};

//填充
fn padding_array(input: &ArrayD<f32>, pad: (usize, usize)) -> ArrayD<f32> {
    let (pad_h, pad_w) = pad;
    if pad_h == 0 && pad_w == 0 {
        return input.clone();
    }

    let input_view = input.view().into_dimensionality::<Ix4>().unwrap();
    let (b, c, h, w) = input_view.dim();
    let mut padded = Array::zeros((b, c, h + 2 * pad_h, w + 2 * pad_w));
    padded
        .slice_mut(s![.., .., pad_h..pad_h + h, pad_w..pad_w + w])
        .assign(&input_view);
    padded.into_dyn()
}

// Input: [Cin, H, W] -> Output: [Cin*KH*KW, Hout*Wout]
fn im2col_2d(
    input: &ArrayView3<f32>,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    out_dim: (usize, usize),
) -> Array2<f32> {
    let (cin, _, _) = input.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let (hout, wout) = out_dim;

    let mut col = Array2::<f32>::zeros((cin * kh * kw, hout * wout));

    let mut col_idx = 0;
    for y in 0..hout {
        for x in 0..wout {
            let mut row_idx = 0;
            for ic in 0..cin {
                for ky in 0..kh {
                    for kx in 0..kw {
                        col[[row_idx, col_idx]] = input[[ic, y * sh + ky, x * sw + kx]];
                        row_idx += 1;
                    }
                }
            }
            col_idx += 1;
        }
    }
    col
}

// Input: [Cin*KH*KW, Hout*Wout] -> Accumulate to: [Cin, H, W]
// 这是一个累加过程 (+=)，因为多个卷积窗口可能重叠在同一个输入像素上
fn col2im_2d(
    col: &Array2<f32>,
    input_shape: (usize, usize, usize), // (Cin, H, W)
    kernel_size: (usize, usize),
    stride: (usize, usize),
    out_dim: (usize, usize),
) -> Array3<f32> {
    let (cin, h_in, w_in) = input_shape;
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let (hout, wout) = out_dim;

    let mut img = Array3::<f32>::zeros((cin, h_in, w_in));

    // 遍历 col 的每一列 (对应一个输出像素)
    let mut col_idx = 0;
    for y in 0..hout {
        for x in 0..wout {
            let mut row_idx = 0;
            for ic in 0..cin {
                for ky in 0..kh {
                    for kx in 0..kw {
                        img[[ic, y * sh + ky, x * sw + kx]] += col[[row_idx, col_idx]];
                        row_idx += 1;
                    }
                }
            }
            col_idx += 1;
        }
    }
    img
}

#[derive(Clone, Copy)]
struct ConvGeometry {
    in_c: usize,
    out_c: usize,
    kh: usize,
    kw: usize,
    out_h: usize,
    out_w: usize,
    padding: (usize, usize),
    stride: (usize, usize),
}

pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Tensor {
    let build_graph = !is_no_grad()
        && (input.requires_grad()
            || weight.requires_grad()
            || bias.map_or(false, |b| b.requires_grad()));

    let (x_data, w_data, b_data) = (input.data(), weight.data(), bias.map(|t| t.data()));

    let x_view_4d = x_data.view().into_dimensionality::<Ix4>().unwrap();
    let w_view_4d = w_data.view().into_dimensionality::<Ix4>().unwrap();

    let (batch_size, in_channels, in_h, in_w) = x_view_4d.dim();
    let (out_channels, w_in_channels, k_h, k_w) = w_view_4d.dim();
    assert_eq!(
        in_channels, w_in_channels,
        "Conv2d channel mismatch: input has {} channels, weight expects {}",
        in_channels, w_in_channels
    );
    let (pad_h, pad_w) = padding;
    let (stride_h, stride_w) = stride;

    let out_h = (in_h + 2 * pad_h - k_h) / stride_h + 1;
    let out_w = (in_w + 2 * pad_w - k_w) / stride_w + 1;

    // --- Forward Pass ---
    let x_padded = padding_array(&x_data, padding);
    let x_padded_view = x_padded.view().into_dimensionality::<Ix4>().unwrap();

    let mut output = Array::zeros((batch_size, out_channels, out_h, out_w));

    // Weight: [OutC, InC * KH * KW]
    let w_col = w_data
        .to_shape((out_channels, in_channels * k_h * k_w))
        .unwrap();
    let w_col = w_col.as_standard_layout();
    let bias_1d = b_data
        .as_ref()
        .map(|bb| bb.view().into_dimensionality::<Ix1>().unwrap());

    Zip::from(output.outer_iter_mut())
        .and(x_padded_view.outer_iter())
        .par_for_each(|mut out_sample, x_sample| {
            // im2col: [K_dim, Out_pixels]
            let im2col_matrix =
                im2col_2d(&x_sample, (k_h, k_w), (stride_h, stride_w), (out_h, out_w));

            // GEMM: [OutC, K_dim] @ [K_dim, Out_pixels] -> [OutC, Out_pixels]
            let out_matrix = w_col.dot(&im2col_matrix);

            let out_reshaped = out_matrix
                .into_shape_with_order((out_channels, out_h, out_w))
                .unwrap();
            out_sample.assign(&out_reshaped);

            if let Some(bb) = &bias_1d {
                for o_c in 0..out_channels {
                    out_sample
                        .slice_mut(s![o_c, .., ..])
                        .mapv_inplace(|v| v + bb[o_c]);
                }
            }
        });

    let output_dyn = output.into_dyn();

    if !build_graph {
        return Tensor::from_data_no_grad(output_dyn);
    }

    let geometry = ConvGeometry {
        in_c: in_channels,
        out_c: out_channels,
        kh: k_h,
        kw: k_w,
        out_h,
        out_w,
        padding,
        stride,
    };

    let input_clone = input.clone();
    let weight_clone = weight.clone();
    let bias_clone = bias.cloned();

    let mut parents = vec![input.clone(), weight.clone()];
    if let Some(b) = &bias_clone {
        parents.push(b.clone());
    }

    Tensor::from_op(
        output_dyn,
        parents,
        Box::new(move |grad_output| {
            run_backward_conv2d_gemm(
                grad_output,
                &input_clone,
                &weight_clone,
                bias_clone.as_ref(),
                geometry,
            );
        }),
    )
}

fn run_backward_conv2d_gemm(
    grad_output: &ArrayD<f32>,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    geo: ConvGeometry,
) {
    let ConvGeometry {
        in_c,
        out_c,
        kh,
        kw,
        out_h,
        out_w,
        padding,
        stride,
    } = geo;
    let (pad_h, pad_w) = padding;

    let (x_dat, w_dat) = (input.data(), weight.data());

    let grad_out_view = grad_output.view().into_dimensionality::<Ix4>().unwrap();
    let x_pad = padding_array(&x_dat, padding);
    let x_pad_4d = x_pad.view().into_dimensionality::<Ix4>().unwrap();

    // 公式: dX_col = W^T * dY
    // W: [OutC, InC*KH*KW] -> W^T: [InC*KH*KW, OutC]
    if input.requires_grad() {
        let w_col = w_dat
            .to_shape((out_c, in_c * kh * kw))
            .unwrap()
            .into_owned();
        let w_col_t = w_col.t();

        let mut grad_input_padded = Array::<f32, Ix4>::zeros(x_pad_4d.dim());
        let (padded_h, padded_w) = (x_pad_4d.shape()[2], x_pad_4d.shape()[3]);

        // 并行计算 dX
        Zip::from(grad_input_padded.outer_iter_mut())
            .and(grad_out_view.outer_iter())
            .par_for_each(|mut g_in_sample, g_out_sample| {
                // g_out_sample: [OutC, OutH, OutW] -> [OutC, OutPixels]
                let g_out_col = g_out_sample.to_shape((out_c, out_h * out_w)).unwrap();

                let d_col = w_col_t.dot(&g_out_col);

                let d_im = col2im_2d(
                    &d_col,
                    (in_c, padded_h, padded_w),
                    (kh, kw),
                    stride,
                    (out_h, out_w),
                );

                g_in_sample.assign(&d_im);
            });

        // 去除 padding
        let grad_input = grad_input_padded
            .slice(s![
                ..,
                ..,
                pad_h..pad_h + x_dat.shape()[2],
                pad_w..pad_w + x_dat.shape()[3]
            ])
            .to_owned()
            .into_dyn();
        input.add_grad(grad_input);
    }

    // 公式: dW = dY * X_col^T
    if weight.requires_grad() {
        let per_sample = Zip::from(grad_out_view.outer_iter())
            .and(x_pad_4d.outer_iter())
            .par_map_collect(|g_out_sample, x_sample| {
                let im2col_matrix = im2col_2d(&x_sample, (kh, kw), stride, (out_h, out_w));
                let g_out_col = g_out_sample.to_shape((out_c, out_h * out_w)).unwrap();
                g_out_col.dot(&im2col_matrix.t())
            });

        // 累加所有样本的梯度 (Reduce)
        let mut final_grad_w = Array2::<f32>::zeros((out_c, in_c * kh * kw));
        for g in per_sample.iter() {
            final_grad_w += g;
        }
        let final_grad_w = final_grad_w
            .into_shape_with_order(w_dat.shape())
            .unwrap()
            .into_dyn();
        weight.add_grad(final_grad_w);
    }

    if let Some(bc) = bias {
        if bc.requires_grad() {
            let grad_bias = grad_out_view
                .sum_axis(Axis(0))
                .sum_axis(Axis(1))
                .sum_axis(Axis(1));
            bc.add_grad(grad_bias.into_dyn());
        }
    }
}

pub fn max_pool2d(input: &Tensor, kernel_size: (usize, usize), stride: (usize, usize)) -> Tensor {
    let x_data = input.data();
    let shape = x_data.shape();
    let (b, c, h, w) = (shape[0], shape[1], shape[2], shape[3]);
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let out_h = (h - kh) / sh + 1;
    let out_w = (w - kw) / sw + 1;
    let mut output = Array::<f32, Ix4>::zeros((b, c, out_h, out_w));
    let mut mask = Array::<f32, Ix4>::zeros((b, c, h, w));
    let x_view = x_data.view().into_dimensionality::<Ix4>().unwrap();

    Zip::from(output.outer_iter_mut())
        .and(x_view.outer_iter())
        .and(mask.outer_iter_mut())
        .par_for_each(|mut out_sample, x_sample, mut mask_sample| {
            Zip::from(out_sample.outer_iter_mut())
                .and(x_sample.outer_iter())
                .and(mask_sample.outer_iter_mut())
                .for_each(|mut out_plane, x_plane, mut mask_plane| {
                    for y in 0..out_h {
                        for x in 0..out_w {
                            let h_start = y * sh;
                            let w_start = x * sw;
                            let mut max_val = f32::NEG_INFINITY;
                            let mut max_idx = (0, 0);
                            for ky in 0..kh {
                                for kx in 0..kw {
                                    let v = x_plane[[h_start + ky, w_start + kx]];
                                    if v > max_val {
                                        max_val = v;
                                        max_idx = (ky, kx);
                                    }
                                }
                            }
                            out_plane[[y, x]] = max_val;
                            mask_plane[[h_start + max_idx.0, w_start + max_idx.1]] = 1.0;
                        }
                    }
                });
        });

    let output = output.into_dyn();
    if is_no_grad() || !input.requires_grad() {
        return Tensor::from_data_no_grad(output);
    }

    let input_clone = input.clone();
    Tensor::from_op(
        output,
        vec![input.clone()],
        Box::new(move |grad_output| {
            let grad_view = grad_output.view().into_dimensionality::<Ix4>().unwrap();
            let mut grad_input = Array::<f32, Ix4>::zeros((b, c, h, w));
            Zip::from(grad_input.outer_iter_mut())
                .and(grad_view.outer_iter())
                .and(mask.outer_iter())
                .par_for_each(|mut g_in_sample, g_out_sample, mask_sample| {
                    Zip::from(g_in_sample.outer_iter_mut())
                        .and(g_out_sample.outer_iter())
                        .and(mask_sample.outer_iter())
                        .for_each(|mut g_in_plane, g_out_plane, mask_plane| {
                            for y in 0..out_h {
                                for x in 0..out_w {
                                    let g = g_out_plane[[y, x]];
                                    let h_start = y * sh;
                                    let w_start = x * sw;
                                    for ky in 0..kh {
                                        for kx in 0..kw {
                                            if mask_plane[[h_start + ky, w_start + kx]] > 0.0 {
                                                g_in_plane[[h_start + ky, w_start + kx]] += g;
                                            }
                                        }
                                    }
                                }
                            }
                        });
                });
            input_clone.add_grad(grad_input.into_dyn());
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array4};

    #[test]
    fn conv2d_matches_direct_sum_with_padding() {
        // 1x1x3x3 输入，全 1 的 3x3 卷积核，padding=1：输出是每个 3x3 邻域之和
        let x = Array4::from_shape_vec((1, 1, 3, 3), (1..=9).map(|v| v as f32).collect())
            .unwrap()
            .into_dyn();
        let w = Array4::<f32>::ones((1, 1, 3, 3)).into_dyn();
        let b = Array1::from(vec![0.5f32]).into_dyn();

        let out = conv2d(
            &Tensor::from_data_no_grad(x),
            &Tensor::from_data_no_grad(w),
            Some(&Tensor::from_data_no_grad(b)),
            (1, 1),
            (1, 1),
        );
        let out = out.data();
        assert_eq!(out.shape(), &[1, 1, 3, 3]);
        // 中心 = 1+..+9 = 45，左上角 = 1+2+4+5 = 12
        assert_abs_diff_eq!(out[[0, 0, 1, 1]], 45.5);
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], 12.5);
    }

    #[test]
    fn conv2d_weight_gradient_is_input_window_sum() {
        let x = Tensor::from_data_no_grad(Array4::<f32>::ones((2, 1, 4, 4)).into_dyn());
        let w = Tensor::parameter(Array4::<f32>::zeros((3, 1, 2, 2)).into_dyn());
        let b = Tensor::parameter(Array1::<f32>::zeros(3).into_dyn());
        let y = conv2d(&x, &w, Some(&b), (2, 2), (0, 0));
        assert_eq!(y.shape(), vec![2, 3, 2, 2]);
        y.sum().backward();
        // 每个卷积核元素看到 2 个样本 x 4 个输出位置，每次输入为 1
        assert!(w.grad().unwrap().iter().all(|&g| (g - 8.0).abs() < 1e-6));
        assert!(b.grad().unwrap().iter().all(|&g| (g - 8.0).abs() < 1e-6));
        assert!(x.grad().is_none());
    }

    #[test]
    fn max_pool_routes_gradient_to_argmax() {
        let x = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0f32, 4.0, 3.0, 2.0])
            .unwrap()
            .into_dyn();
        let x = Tensor::parameter(x);
        let y = max_pool2d(&x, (2, 2), (2, 2));
        assert_eq!(y.item(), 4.0);
        y.sum().backward();
        let g = x.grad().unwrap();
        assert_eq!(g.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 0.0, 0.0]);
    }
}

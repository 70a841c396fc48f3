use crate::autograd::{is_no_grad, Tensor};
use ndarray::{arr0, Array2, ArrayD, Ix2, Zip};
use rayon::prelude::*; // 引入并行迭代

/// labels -> one-hot [B, K]
pub fn one_hot(labels: &[usize], nclasses: usize) -> Tensor {
    let mut t = Array2::<f32>::zeros((labels.len(), nclasses));
    for (i, &label) in labels.iter().enumerate() {
        t[[i, label]] = 1.0;
    }
    Tensor::from_data_no_grad(t.into_dyn())
}

// --- Cross Entropy Loss ---
// 针对 Batch 进行行级并行优化
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// mean over the batch of -log softmax(logits)[target]
    pub fn apply(input_logits: &Tensor, target_onehot: &Tensor) -> Tensor {
        // Forward
        let (loss_val, softmax_output) = {
            let logits_ref = input_logits.data_ref();
            let targets_ref = target_onehot.data_ref();

            let logits_2d = logits_ref.view().into_dimensionality::<Ix2>().unwrap();
            let targets_2d = targets_ref.view().into_dimensionality::<Ix2>().unwrap();
            let (batch_size, dim) = logits_2d.dim();

            // Softmax 结果供 Backward 使用
            let mut softmax_out = Array2::<f32>::zeros((batch_size, dim));

            let total_loss: f32 = Zip::from(softmax_out.outer_iter_mut())
                .and(logits_2d.outer_iter())
                .and(targets_2d.outer_iter())
                .into_par_iter()
                .map(|(mut sm_row, l_row, t_row)| {
                    // log-sum-exp：先减去最大值防止溢出
                    let max_val = l_row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let mut sum_exp = 0.0f32;
                    for (s_val, &l_val) in sm_row.iter_mut().zip(l_row.iter()) {
                        let e = (l_val - max_val).exp();
                        *s_val = e;
                        sum_exp += e;
                    }
                    let log_sum = sum_exp.ln();

                    let mut row_loss = 0.0;
                    for ((s_val, &t_val), &l_val) in sm_row.iter_mut().zip(t_row.iter()).zip(l_row.iter()) {
                        *s_val /= sum_exp;
                        if t_val > 0.0 {
                            row_loss -= t_val * (l_val - max_val - log_sum);
                        }
                    }
                    row_loss
                })
                .sum();

            (total_loss / batch_size.max(1) as f32, softmax_out.into_dyn())
        };

        let result = arr0(loss_val).into_dyn();
        if is_no_grad() || !input_logits.requires_grad() {
            return Tensor::from_data_no_grad(result);
        }

        let input_clone = input_logits.clone();
        let target_clone = target_onehot.clone();

        Tensor::from_op(
            result,
            vec![input_logits.clone(), target_onehot.clone()],
            Box::new(move |grad_output: &ArrayD<f32>| {
                let grad_val = grad_output.first().copied().unwrap_or(0.0);
                let targets = target_clone.data_ref();
                let batch_size = targets.shape()[0].max(1) as f32;
                let factor = grad_val / batch_size;

                // Backward: (Prob - Target) / N * grad
                let grad = Zip::from(&softmax_output)
                    .and(&*targets)
                    .par_map_collect(|&p, &t| (p - t) * factor);
                drop(targets);

                input_clone.add_grad(grad);
            }),
        )
    }
}

use crate::autograd::{is_no_grad, Tensor};
use crate::module::Module;
use ndarray::Zip;

// --- ReLU ---
pub struct ReLU;
impl ReLU {
    pub fn new() -> Self {
        ReLU
    }
}

impl Default for ReLU {
    fn default() -> Self {
        ReLU
    }
}

impl Module for ReLU {
    fn forward(&self, input: Tensor) -> Tensor {
        // Forward: 并行计算 x.max(0.0)
        let data = Zip::from(&*input.data_ref()).par_map_collect(|&x| x.max(0.0));

        if is_no_grad() || !input.requires_grad() {
            return Tensor::from_data_no_grad(data);
        }

        let input_clone = input.clone();
        Tensor::from_op(
            data,
            vec![input],
            Box::new(move |grad| {
                let input_d = input_clone.data();
                let mut grad_input = grad.clone();

                // Backward: 原地修改梯度
                Zip::from(&mut grad_input)
                    .and(&input_d)
                    .par_for_each(|g, &x| {
                        if x <= 0.0 {
                            *g = 0.0;
                        }
                    });
                input_clone.add_grad(grad_input);
            }),
        )
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn relu_masks_negative_inputs_and_gradients() {
        let x = Tensor::parameter(arr1(&[-1.0f32, 0.0, 2.0]).into_dyn());
        let y = ReLU::new().forward(x.clone());
        assert_eq!(y.data().as_slice().unwrap(), &[0.0, 0.0, 2.0]);
        y.sum().backward();
        assert_eq!(x.grad().unwrap().as_slice().unwrap(), &[0.0, 0.0, 1.0]);
    }
}

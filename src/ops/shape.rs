use crate::autograd::{is_no_grad, Tensor};

// 解析目标形状，允许一个 -1（由元素总数推断）
fn resolve_shape(shape: &[i32], numel: usize) -> Vec<usize> {
    let known: usize = shape.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let inferred = shape.iter().filter(|&&d| d < 0).count();
    assert!(inferred <= 1, "Reshape: at most one dimension may be -1, got {:?}", shape);

    shape
        .iter()
        .map(|&d| {
            if d < 0 {
                assert!(known > 0 && numel % known == 0, "Reshape: cannot infer -1 in {:?} for {} elements", shape, numel);
                numel / known
            } else {
                d as usize
            }
        })
        .collect()
}

pub fn reshape(input: &Tensor, shape: Vec<i32>) -> Tensor {
    let (reshaped, old_shape) = {
        let data = input.data_ref();
        let new_shape = resolve_shape(&shape, data.len());
        let reshaped = data
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(new_shape)
            .expect("Reshape failed: Total element count mismatch")
            .into_dyn();
        (reshaped, data.shape().to_vec())
    };

    if is_no_grad() || !input.requires_grad() {
        return Tensor::from_data_no_grad(reshaped);
    }

    let input_clone = input.clone();
    Tensor::from_op(
        reshaped,
        vec![input.clone()],
        Box::new(move |grad| {
            let grad_reshaped = grad
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(old_shape.clone())
                .expect("Backward Reshape failed")
                .into_dyn();
            input_clone.add_grad(grad_reshaped);
        }),
    )
}

/// [B, ...] -> [B, prod(...)]
pub fn flatten(input: &Tensor) -> Tensor {
    let b = input.data_ref().shape()[0];
    reshape(input, vec![b as i32, -1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn flatten_keeps_batch_and_routes_gradient_back() {
        let x = Tensor::parameter(ArrayD::ones(vec![2, 3, 2, 2]));
        let y = flatten(&x);
        assert_eq!(y.shape(), vec![2, 12]);
        y.sum().backward();
        assert_eq!(x.grad().unwrap().shape(), &[2, 3, 2, 2]);
    }

    #[test]
    #[should_panic]
    fn reshape_rejects_two_inferred_dims() {
        let x = Tensor::from_data_no_grad(ArrayD::zeros(vec![4]));
        reshape(&x, vec![-1, -1]);
    }
}

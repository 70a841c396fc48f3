use crate::autograd::{is_no_grad, Tensor};
use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayD, Ix2};

// A[..., K] @ B^T, where B is [N(out), K(in)]
// output: [..., N]
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    let build_graph = !is_no_grad() && (a.requires_grad() || b.requires_grad());

    let a_shape = a.shape();
    let b_shape = b.shape();

    if b_shape.len() != 2 {
        panic!("MatMul RHS must be 2D, got {:?}", b_shape);
    }

    // b: [N, K]
    let k_dim = a_shape[a_shape.len() - 1];
    let n_dim = b_shape[0];

    if k_dim != b_shape[1] {
        panic!(
            "MatMul shape mismatch: a {:?} (K={}) vs b {:?} (K={})",
            a_shape, k_dim, b_shape, b_shape[1]
        );
    }

    let m_dim = a_shape.iter().product::<usize>() / k_dim;

    let res_2d = {
        let ad = a.data_ref();
        let bd = b.data_ref();
        let b_2d = bd.view().into_dimensionality::<Ix2>().unwrap(); // [N,K]
        let a_2d = to_2d(&ad, m_dim, k_dim);

        let mut res = Array2::<f32>::zeros((m_dim, n_dim));
        general_mat_mul(1.0, &a_2d, &b_2d.t(), 0.0, &mut res);
        res
    };

    // 恢复输出形状: [..., N]
    let mut out_shape = a_shape.clone();
    let last_idx = out_shape.len() - 1;
    out_shape[last_idx] = n_dim;

    let result = res_2d
        .into_shape_with_order(out_shape)
        .expect("MatMul output reshape failed")
        .into_dyn();

    if !build_graph {
        return Tensor::from_data_no_grad(result);
    }

    let a_clone = a.clone();
    let b_clone = b.clone();

    Tensor::from_op(
        result,
        vec![a.clone(), b.clone()],
        Box::new(move |grad: &ArrayD<f32>| {
            // grad: [..., N] -> [M,N]
            let grad_2d = to_2d(grad, m_dim, n_dim);

            // Backward 必须 clone 数据以避免 RefCell 借用冲突
            let (a_data, b_data) = (a_clone.data(), b_clone.data());
            let a_2d = to_2d(&a_data, m_dim, k_dim);
            let b_2d = b_data.view().into_dimensionality::<Ix2>().unwrap();

            if a_clone.requires_grad() {
                // dA = dY @ B  -> [M,K]
                let mut da_2d = Array2::<f32>::zeros((m_dim, k_dim));
                general_mat_mul(1.0, &grad_2d, &b_2d, 0.0, &mut da_2d);
                let da = da_2d
                    .into_shape_with_order(a_data.shape())
                    .expect("MatMul grad reshape failed")
                    .into_dyn();
                a_clone.add_grad(da);
            }

            if b_clone.requires_grad() {
                // dB = dY^T @ A -> [N,K]
                let mut db_2d = Array2::<f32>::zeros((n_dim, k_dim));
                general_mat_mul(1.0, &grad_2d.t(), &a_2d, 0.0, &mut db_2d);
                b_clone.add_grad(db_2d.into_dyn());
            }
        }),
    )
}

// 先转成标准布局（行主序）再 reshape 成 2D
fn to_2d(data: &ArrayD<f32>, rows: usize, cols: usize) -> Array2<f32> {
    data.as_standard_layout()
        .into_owned()
        .into_shape_with_order((rows, cols))
        .expect("MatMul operand reshape failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn matmul_uses_out_in_weight_layout() {
        let x = Tensor::parameter(arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn());
        // W: [N=3, K=2]
        let w = Tensor::parameter(arr2(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]]).into_dyn());
        let y = matmul(&x, &w);
        assert_eq!(y.shape(), vec![2, 3]);
        assert_eq!(
            y.data().into_dimensionality::<Ix2>().unwrap(),
            arr2(&[[1.0, 2.0, 3.0], [3.0, 4.0, 7.0]])
        );

        y.sum().backward();
        // dW[n,k] = sum_m x[m,k]
        assert_eq!(
            w.grad().unwrap().into_dimensionality::<Ix2>().unwrap(),
            arr2(&[[4.0, 6.0], [4.0, 6.0], [4.0, 6.0]])
        );
        // dX[m,k] = sum_n W[n,k]
        assert_eq!(
            x.grad().unwrap().into_dimensionality::<Ix2>().unwrap(),
            arr2(&[[2.0, 2.0], [2.0, 2.0]])
        );
    }
}

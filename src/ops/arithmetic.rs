// src/ops/arithmetic.rs
use crate::autograd::{is_no_grad, Tensor};
use ndarray::{ArrayD, ArrayViewD, Axis, Zip};
use std::ops::{Add, Mul, Sub};

fn reduce_gradient(grad: ArrayViewD<'_, f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.to_owned();
    }

    let mut res = grad.to_owned();
    let g_ndim = res.ndim();
    let t_ndim = target_shape.len();

    // 广播时左侧补出的维度全部求和
    if g_ndim > t_ndim {
        for _ in 0..(g_ndim - t_ndim) {
            res = res.sum_axis(Axis(0));
        }
    }

    for i in 0..res.ndim() {
        if target_shape[i] == 1 && res.shape()[i] > 1 {
            let summed = res.sum_axis(Axis(i));
            res = summed.insert_axis(Axis(i));
        } else if target_shape[i] != res.shape()[i] {
            panic!(
                "Gradient shape mismatch. Grad: {:?}, Target: {:?}",
                grad.shape(),
                target_shape
            );
        }
    }

    res
}

fn needs_graph(lhs: &Tensor, rhs: &Tensor) -> bool {
    !is_no_grad() && (lhs.requires_grad() || rhs.requires_grad())
}

impl Add for Tensor {
    type Output = Tensor;
    fn add(self, rhs: Tensor) -> Tensor {
        let data = &*self.data_ref() + &*rhs.data_ref();

        if !needs_graph(&self, &rhs) {
            return Tensor::from_data_no_grad(data);
        }

        let lhs = self.clone();
        let rhs_c = rhs.clone();

        Tensor::from_op(
            data,
            vec![self, rhs],
            Box::new(move |grad| {
                let l_shape = lhs.shape();
                let r_shape = rhs_c.shape();
                if lhs.requires_grad() {
                    lhs.add_grad(reduce_gradient(grad.view(), &l_shape));
                }
                if rhs_c.requires_grad() {
                    rhs_c.add_grad(reduce_gradient(grad.view(), &r_shape));
                }
            }),
        )
    }
}
impl<'a, 'b> Add<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn add(self, rhs: &'b Tensor) -> Tensor {
        self.clone() + rhs.clone()
    }
}

impl Sub for Tensor {
    type Output = Tensor;
    fn sub(self, rhs: Tensor) -> Tensor {
        let data = &*self.data_ref() - &*rhs.data_ref();

        if !needs_graph(&self, &rhs) {
            return Tensor::from_data_no_grad(data);
        }

        let lhs = self.clone();
        let rhs_c = rhs.clone();

        Tensor::from_op(
            data,
            vec![self, rhs],
            Box::new(move |grad| {
                let l_shape = lhs.shape();
                let r_shape = rhs_c.shape();
                if lhs.requires_grad() {
                    lhs.add_grad(reduce_gradient(grad.view(), &l_shape));
                }
                if rhs_c.requires_grad() {
                    // 并行取反
                    let grad_neg = Zip::from(grad).par_map_collect(|&x| -x);
                    rhs_c.add_grad(reduce_gradient(grad_neg.view(), &r_shape));
                }
            }),
        )
    }
}
impl<'a, 'b> Sub<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &'b Tensor) -> Tensor {
        self.clone() - rhs.clone()
    }
}

impl Mul for Tensor {
    type Output = Tensor;
    fn mul(self, rhs: Tensor) -> Tensor {
        let data = &*self.data_ref() * &*rhs.data_ref();

        if !needs_graph(&self, &rhs) {
            return Tensor::from_data_no_grad(data);
        }

        let lhs = self.clone();
        let rhs_c = rhs.clone();

        Tensor::from_op(
            data,
            vec![self, rhs],
            Box::new(move |grad| {
                // 先算完两侧梯度再 add_grad：lhs 与 rhs 可能是同一个张量
                let (g_lhs, g_rhs, l_shape, r_shape) = {
                    let a_data = lhs.data_ref();
                    let b_data = rhs_c.data_ref();

                    // 只有 shape 完全一致才用 Zip，否则广播乘法
                    let (gl, gr) = if grad.shape() == a_data.shape() && grad.shape() == b_data.shape() {
                        let gl = Zip::from(grad).and(&*b_data).par_map_collect(|&g, &b| g * b);
                        let gr = Zip::from(grad).and(&*a_data).par_map_collect(|&g, &a| g * a);
                        (gl, gr)
                    } else {
                        (grad * &*b_data, grad * &*a_data)
                    };
                    (gl, gr, a_data.shape().to_vec(), b_data.shape().to_vec())
                };

                if lhs.requires_grad() {
                    lhs.add_grad(reduce_gradient(g_lhs.view(), &l_shape));
                }
                if rhs_c.requires_grad() {
                    rhs_c.add_grad(reduce_gradient(g_rhs.view(), &r_shape));
                }
            }),
        )
    }
}
impl<'a, 'b> Mul<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &'b Tensor) -> Tensor {
        self.clone() * rhs.clone()
    }
}

pub fn sum(input: &Tensor) -> Tensor {
    let sum_val = input.data_ref().sum();

    // 结果是一个 0 维标量 Tensor
    let result = ndarray::arr0(sum_val).into_dyn();

    if is_no_grad() || !input.requires_grad() {
        return Tensor::from_data_no_grad(result);
    }

    let input_clone = input.clone();

    Tensor::from_op(
        result,
        vec![input.clone()],
        Box::new(move |grad| {
            // dL/dx = dL/dSum * 1，标量梯度广播到输入形状
            let g = grad.first().copied().unwrap_or(0.0);
            let grad_input = ArrayD::from_elem(input_clone.shape(), g);
            input_clone.add_grad(grad_input);
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn broadcast_add_reduces_bias_gradient() {
        let x = Tensor::parameter(arr2(&[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn());
        let b = Tensor::parameter(arr1(&[0.5f32, -0.5]).into_dyn());
        let y = (&x + &b).sum();
        y.backward();
        assert_eq!(b.grad().unwrap().as_slice().unwrap(), &[3.0, 3.0]);
        assert_eq!(x.grad().unwrap(), ArrayD::<f32>::ones(vec![3, 2]));
    }

    #[test]
    fn sub_negates_rhs_gradient() {
        let a = Tensor::parameter(arr1(&[1.0f32, 2.0]).into_dyn());
        let b = Tensor::parameter(arr1(&[4.0f32, 4.0]).into_dyn());
        (&a - &b).sum().backward();
        assert_eq!(a.grad().unwrap().as_slice().unwrap(), &[1.0, 1.0]);
        assert_eq!(b.grad().unwrap().as_slice().unwrap(), &[-1.0, -1.0]);
    }

    #[test]
    fn constant_operand_receives_no_gradient() {
        let w = Tensor::parameter(arr1(&[2.0f32, 3.0]).into_dyn());
        let c = Tensor::from_data_no_grad(arr1(&[10.0f32, 100.0]).into_dyn());
        (&w * &c).sum().backward();
        assert_eq!(w.grad().unwrap().as_slice().unwrap(), &[10.0, 100.0]);
        assert!(c.grad().is_none());
    }
}

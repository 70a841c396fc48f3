use crate::autograd::Tensor;
use ndarray::prelude::*;
use ndarray::Zip;

pub trait Optimizer {
    fn step(&mut self);
    fn zero_grad(&self) {
        for param in self.params() {
            param.zero_grad();
        }
    }
    fn params(&self) -> &[Tensor];
}

pub struct SGD {
    params: Vec<Tensor>,
    lr: f32,
    momentum: f32,
    velocities: Vec<Option<ArrayD<f32>>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        let len = params.len();
        SGD {
            params,
            lr,
            momentum: 0.0, // 默认无动量
            velocities: vec![None; len],
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// 动量缓冲（checkpoint 用），尚未更新过的参数为 None
    pub fn velocities(&self) -> &[Option<ArrayD<f32>>] {
        &self.velocities
    }

    pub fn set_velocities(&mut self, velocities: Vec<Option<ArrayD<f32>>>) {
        assert_eq!(velocities.len(), self.params.len(), "velocity count must match parameter count");
        self.velocities = velocities;
    }
}

impl Optimizer for SGD {
    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn step(&mut self) {
        let lr = self.lr;
        let m = self.momentum;

        for (param, velocity) in self.params.iter().zip(self.velocities.iter_mut()) {
            let mut p_inner = param.0.borrow_mut();
            // 先把 grad 取出来，避免与 data.view_mut() 的可变借用冲突
            let grad = match p_inner.grad.take() {
                Some(g) => g,
                None => continue,
            };

            if m == 0.0 {
                // 标准 SGD: w -= lr * grad
                Zip::from(p_inner.data.view_mut())
                    .and(grad.view())
                    .for_each(|w, g| {
                        *w -= lr * *g;
                    });
            } else {
                // SGD with Momentum（PyTorch 默认行为）
                // v = m * v + grad
                // w = w - lr * v
                let v_buf = velocity.get_or_insert_with(|| ArrayD::zeros(grad.shape()));

                Zip::from(v_buf.view_mut())
                    .and(grad.view())
                    .for_each(|v, g| {
                        *v = m * (*v) + *g;
                    });

                Zip::from(p_inner.data.view_mut())
                    .and(v_buf.view())
                    .for_each(|w, vv| {
                        *w -= lr * *vv;
                    });
            }

            p_inner.grad = Some(grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    #[test]
    fn momentum_matches_pytorch_update_rule() {
        let w = Tensor::parameter(arr1(&[1.0f32]).into_dyn());
        let mut opt = SGD::new(vec![w.clone()], 0.1).with_momentum(0.9);

        // 两步恒定梯度 1.0：v1 = 1, w1 = 0.9；v2 = 1.9, w2 = 0.71
        for _ in 0..2 {
            opt.zero_grad();
            w.add_grad(arr1(&[1.0f32]).into_dyn());
            opt.step();
        }
        assert_relative_eq!(w.data()[[0]], 0.71, epsilon = 1e-6);
        assert_relative_eq!(opt.velocities()[0].as_ref().unwrap()[[0]], 1.9, epsilon = 1e-6);
    }

    #[test]
    fn parameters_without_gradient_are_skipped() {
        let a = Tensor::parameter(arr1(&[1.0f32]).into_dyn());
        let b = Tensor::parameter(arr1(&[1.0f32]).into_dyn());
        let mut opt = SGD::new(vec![a.clone(), b.clone()], 0.5);
        a.add_grad(arr1(&[2.0f32]).into_dyn());
        opt.step();
        assert_eq!(a.data()[[0]], 0.0);
        assert_eq!(b.data()[[0]], 1.0);
        assert!(opt.velocities()[1].is_none());
    }
}

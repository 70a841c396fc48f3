// src/autograd.rs
use ndarray::prelude::*;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::rc::Rc;

// 图构建开关按线程记录（Tensor 基于 Rc，不跨线程）
thread_local! {
    static NO_GRAD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static INFERENCE_MODE: Cell<bool> = const { Cell::new(false) };
}

pub struct NoGradGuard {
    _priv: (),
}

impl NoGradGuard {
    pub fn enter() -> Self {
        NO_GRAD_DEPTH.with(|d| d.set(d.get() + 1));
        Self { _priv: () }
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        NO_GRAD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// 开/关 推理模式（eval_mode/train_mode 会调用它）
pub fn set_inference_mode(on: bool) {
    INFERENCE_MODE.with(|m| m.set(on));
}

#[inline]
pub fn is_inference_mode() -> bool {
    INFERENCE_MODE.with(|m| m.get())
}

/// no_grad 的判定：
/// - 在 NoGradGuard 作用域内为 true
/// - 或者处于 inference_mode 为 true
#[inline]
pub fn is_no_grad() -> bool {
    NO_GRAD_DEPTH.with(|d| d.get()) > 0 || is_inference_mode()
}

/// 便利封装：no_grad(|| { ... })
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let _g = NoGradGuard::enter();
    f()
}

pub type BackwardOp = Box<dyn Fn(&ArrayD<f32>)>;

pub struct TensorData {
    pub data: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
    pub parents: Vec<Tensor>,
    pub backward_op: Option<BackwardOp>,
    pub requires_grad: bool,
}

#[derive(Clone)]
pub struct Tensor(pub(crate) Rc<RefCell<TensorData>>);

impl Tensor {
    /// 由 op 产生的中间节点
    pub(crate) fn from_op(data: ArrayD<f32>, parents: Vec<Tensor>, backward_op: BackwardOp) -> Tensor {
        Tensor(Rc::new(RefCell::new(TensorData {
            data,
            grad: None,
            parents,
            backward_op: Some(backward_op),
            requires_grad: true,
        })))
    }

    /// 创建叶子张量（显式指定 requires_grad）
    pub fn from_data_with_grad_flag(data: ArrayD<f32>, requires_grad: bool) -> Tensor {
        Tensor(Rc::new(RefCell::new(TensorData {
            data,
            grad: None,
            parents: vec![],
            backward_op: None,
            requires_grad,
        })))
    }

    /// 创建叶子张量：根据 is_no_grad() 自动决定 requires_grad
    pub fn from_data(data: ArrayD<f32>) -> Tensor {
        let req = !is_no_grad();
        Tensor::from_data_with_grad_flag(data, req)
    }

    /// 输入/常量：不需要梯度
    pub fn from_data_no_grad(data: ArrayD<f32>) -> Tensor {
        Tensor::from_data_with_grad_flag(data, false)
    }

    /// 训练参数：需要梯度（叶子）
    pub fn parameter(data: ArrayD<f32>) -> Tensor {
        Tensor::from_data_with_grad_flag(data, true)
    }

    /// 获取数据的只读引用（零拷贝）
    pub fn data_ref(&self) -> Ref<'_, ArrayD<f32>> {
        let borrow = self.0.borrow();
        Ref::map(borrow, |t| &t.data)
    }

    /// 获取梯度的只读引用（零拷贝）
    pub fn grad_ref(&self) -> Ref<'_, Option<ArrayD<f32>>> {
        let borrow = self.0.borrow();
        Ref::map(borrow, |t| &t.grad)
    }

    /// 获取数据的可变引用
    pub fn data_mut(&self) -> RefMut<'_, ArrayD<f32>> {
        let borrow = self.0.borrow_mut();
        RefMut::map(borrow, |t| &mut t.data)
    }

    pub fn data(&self) -> ArrayD<f32> {
        self.0.borrow().data.clone()
    }

    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.0.borrow().grad.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().data.shape().to_vec()
    }

    /// 0 维（或单元素）张量的值
    pub fn item(&self) -> f32 {
        self.0.borrow().data.first().copied().unwrap_or(0.0)
    }

    /// 用新数据替换（形状可以不同），梯度清空
    pub fn set_data(&self, data: ArrayD<f32>) {
        let mut inner = self.0.borrow_mut();
        inner.data = data;
        inner.grad = None;
    }

    pub fn sum(&self) -> Tensor {
        crate::ops::arithmetic::sum(self)
    }

    pub fn reshape(&self, shape: Vec<i32>) -> Tensor {
        crate::ops::shape::reshape(self, shape)
    }

    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    pub fn add_grad(&self, grad: ArrayD<f32>) {
        let mut inner = self.0.borrow_mut();

        if inner.data.shape() != grad.shape() {
            panic!(
                "CRITICAL: Gradient shape mismatch!\nParameter Shape: {:?}\nGradient Shape: {:?}\nHint: Check ops/arithmetic.rs reduce_gradient logic.",
                inner.data.shape(),
                grad.shape()
            );
        }

        if let Some(existing) = &mut inner.grad {
            *existing += &grad;
        } else {
            inner.grad = Some(grad);
        }
    }

    pub fn backward(&self) {
        let mut topo = Vec::new();
        let mut visited = HashSet::new();

        fn build_topo(
            node: &Tensor,
            topo: &mut Vec<Tensor>,
            visited: &mut HashSet<*const TensorData>,
        ) {
            let ptr = node.0.as_ptr() as *const TensorData;
            if visited.contains(&ptr) {
                return;
            }
            visited.insert(ptr);

            for parent in &node.0.borrow().parents {
                build_topo(parent, topo, visited);
            }
            topo.push(node.clone());
        }

        build_topo(self, &mut topo, &mut visited);

        let seed = ArrayD::ones(self.data_ref().shape());
        self.add_grad(seed);

        for node in topo.iter().rev() {
            // grad 先 clone 出来，避免 backward_op 内部对自身 add_grad 时借用冲突
            let grad = node.0.borrow().grad.clone();
            if let Some(grad) = grad {
                let inner = node.0.borrow();
                if let Some(op) = &inner.backward_op {
                    op(&grad);
                }
            }
        }
    }

    /// detach：返回一个新 Tensor（数据拷贝），requires_grad=false，且无 parents/backward_op
    pub fn detach(&self) -> Tensor {
        let d = self.0.borrow().data.clone();
        Tensor::from_data_with_grad_flag(d, false)
    }
}

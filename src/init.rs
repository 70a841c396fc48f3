use crate::autograd::Tensor;
use ndarray::{Array, ArrayD, IxDyn};
use rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;

pub enum InitType {
    /// PyTorch nn.Linear / nn.Conv2d 默认初始化：U(-1/sqrt(fan_in), 1/sqrt(fan_in))
    KaimingUniform { fan_in: usize },
    /// For ReLU (He)
    KaimingNormal { fan_in: usize },
    Zeros, // For Bias
}

/// 按给定分布创建参数张量（可复现：随机数来自调用方的 rng）
pub fn tensor_init<R: Rng + ?Sized>(shape: Vec<usize>, init_type: InitType, rng: &mut R) -> Tensor {
    let shape_dyn = IxDyn(shape.as_slice());

    let data = match init_type {
        InitType::Zeros => ArrayD::zeros(shape_dyn),

        InitType::KaimingUniform { fan_in } => {
            let limit = 1.0 / (fan_in.max(1) as f32).sqrt();
            Array::random_using(shape_dyn, Uniform::new(-limit, limit), rng)
        }

        InitType::KaimingNormal { fan_in } => {
            let std = (2.0 / fan_in.max(1) as f32).sqrt();
            Array::random_using(shape_dyn, Normal::new(0.0, std).unwrap(), rng)
        }
    };

    Tensor::parameter(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn kaiming_uniform_respects_fan_in_bound() {
        let mut rng = StdRng::seed_from_u64(0);
        let t = tensor_init(vec![16, 25], InitType::KaimingUniform { fan_in: 25 }, &mut rng);
        assert!(t.requires_grad());
        assert!(t.data().iter().all(|&v| v.abs() <= 0.2));

        let z = tensor_init(vec![3], InitType::Zeros, &mut rng);
        assert!(z.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn same_seed_gives_same_weights() {
        let a = tensor_init(vec![4, 4], InitType::KaimingNormal { fan_in: 4 }, &mut StdRng::seed_from_u64(9));
        let b = tensor_init(vec![4, 4], InitType::KaimingNormal { fan_in: 4 }, &mut StdRng::seed_from_u64(9));
        assert_eq!(a.data(), b.data());
    }
}

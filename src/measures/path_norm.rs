// src/measures/path_norm.rs
use crate::autograd::{no_grad, Tensor};
use crate::module::{Module, ParamSnapshot};
use ndarray::ArrayD;

/// l_p path-norm: every parameter is replaced by `|w|^p`, an all-ones input of
/// shape `input_size` goes through the network, and the summed output is
/// raised to `1/p`. Parameters are restored before returning.
pub fn lp_path_norm(model: &dyn Module, p: f64, input_size: &[usize]) -> f64 {
    let snapshot = ParamSnapshot::capture(model);
    let pf = p as f32;
    for param in model.parameters() {
        param.data_mut().mapv_inplace(|w| w.abs().powf(pf));
    }

    let total = no_grad(|| {
        let ones = Tensor::from_data_no_grad(ArrayD::ones(input_size.to_vec()));
        let out = model.forward(ones);
        let data = out.data_ref();
        data.iter().map(|&v| v as f64).sum::<f64>()
    });

    snapshot.restore();
    total.powf(1.0 / p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Linear, ReLU};
    use crate::sequential;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn path_norm_of_two_layer_net() {
        let mut rng = StdRng::seed_from_u64(0);
        let l1 = Linear::new(2, 2, &mut rng);
        let l2 = Linear::new(2, 1, &mut rng);
        l1.weight.set_data(arr2(&[[1.0f32, -2.0], [0.5, 1.0]]).into_dyn());
        l1.bias.as_ref().unwrap().set_data(arr1(&[0.0f32, -1.0]).into_dyn());
        l2.weight.set_data(arr2(&[[-1.0f32, 2.0]]).into_dyn());
        l2.bias.as_ref().unwrap().set_data(arr1(&[0.0f32]).into_dyn());
        let net = sequential![l1, ReLU::new(), l2];
        let before = net.parameters()[0].data();

        // p = 1: hidden = [3, 2.5], out = 3 + 2 * 2.5 = 8
        assert_relative_eq!(lp_path_norm(&net, 1.0, &[1, 2]), 8.0, epsilon = 1e-5);
        // p = 2: hidden = [5, 2.25], out = 5 + 4 * 2.25 = 14
        assert_relative_eq!(lp_path_norm(&net, 2.0, &[1, 2]), 14.0f64.sqrt(), epsilon = 1e-5);

        assert_eq!(net.parameters()[0].data(), before);
    }
}

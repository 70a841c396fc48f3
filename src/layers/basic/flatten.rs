use crate::autograd::Tensor;
use crate::module::Module;
use crate::ops::shape::flatten;

pub struct Flatten;
impl Flatten { pub fn new() -> Self { Flatten } }
impl Default for Flatten { fn default() -> Self { Flatten } }
impl Module for Flatten {
    fn forward(&self, input: Tensor) -> Tensor { flatten(&input) }
    fn parameters(&self) -> Vec<Tensor> { vec![] }
}

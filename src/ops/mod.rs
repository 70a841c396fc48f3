pub mod arithmetic;
pub mod convolution;
pub mod matmul;
pub mod shape;

pub mod basic;
pub mod conv;
pub mod activation;

// 重新导出 (Re-export)：use genbounds::layers::*; 即可拿到所有层

// Basic
pub use basic::Linear;
pub use basic::Flatten;

// Conv
pub use conv::Conv2D;
pub use conv::MaxPool2D;

pub use activation::ReLU;

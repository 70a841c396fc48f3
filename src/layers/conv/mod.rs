pub mod conv2d;
pub mod pool;

pub use conv2d::Conv2D;
pub use pool::MaxPool2D;
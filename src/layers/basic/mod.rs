pub mod linear;
pub mod flatten;

pub use linear::Linear;
pub use flatten::Flatten;

// src/lib.rs

pub mod autograd;
#[macro_use] pub mod module;
pub mod optim;
pub mod loss;
pub mod ops;
pub mod init;
pub mod layers;
pub mod models;
pub mod data;
pub mod checkpoint;
pub mod train;
pub mod measures;
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{Error, Result};

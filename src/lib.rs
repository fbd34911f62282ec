pub mod cluster;
pub mod config;
pub mod core;
pub mod utils;

pub use crate::core::version;

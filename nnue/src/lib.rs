pub mod config;
pub mod error;
pub mod export;
pub mod kernels;
pub mod loader;
pub mod network;
pub mod wire;

pub use config::NetConfig;
pub use error::{NnueError, Result};

#[cfg(test)]
mod tests;

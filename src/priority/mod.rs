pub mod config;
pub mod scoring;

pub use config::PriorityConfig;
pub use scoring::{score, select};

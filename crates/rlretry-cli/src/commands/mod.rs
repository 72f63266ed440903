//! CLI command modules

pub mod config;
pub mod simulate;
pub mod weights;

//! # Grafto Config
//!
//! Layered configuration for the Grafto worker process: TOML files,
//! `.env`, and `GRAFTO__`-prefixed environment variables.

mod app_config;
mod jobs;
mod loader;

pub use app_config::*;
pub use jobs::*;
pub use loader::*;

pub mod cli;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod elf;
pub mod engine;
pub mod error;
pub mod index;
pub mod libraries;
pub mod metadata;
pub mod sampler;
pub mod unwind;

pub use config::EngineConfig;
pub use engine::UnwindEngine;
pub use error::{Error, Result};

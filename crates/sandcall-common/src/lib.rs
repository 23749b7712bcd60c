//! Common types, errors, and configuration for sandcall.
//!
//! This crate provides shared functionality used across the sandcall workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine and per-call execution limits
//! - Mount specifications for exposing host directories to guests

pub mod config;
pub mod config_file;
pub mod error;
pub mod mount;

pub use config::{EngineConfig, EntryPointShape, ExecutionConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ModuleSection};
pub use error::RuntimeError;
pub use mount::MountSpec;

//! Host functions implementation for sandcall.
//!
//! This crate provides everything a guest module may import from the host:
//!
//! - [`logging`]: The `env.log` bridge from guest code to `tracing` and the
//!   caller's log callback
//! - [`linker`]: Registration of host functions and the WASI shim a module
//!   asks for
//!
//! # Failure Model
//!
//! Host functions never fail the guest call that invoked them. Unreadable log
//! spans and failing log callbacks are reported through `tracing` only.

pub mod linker;
pub mod logging;

pub use linker::{build_runner, register_all};
pub use logging::LoggingHost;

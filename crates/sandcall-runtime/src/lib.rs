//! Caller-facing API for sandcall.
//!
//! This crate ties the engine, the host functions and the call protocol
//! together behind two types:
//!
//! - [`Runtime`]: One engine plus its compilation cache; loads modules
//! - [`ModuleHandle`]: A loaded module, ready to answer requests
//!
//! # Quick Start
//!
//! ```ignore
//! use sandcall_common::RuntimeConfig;
//! use sandcall_runtime::{LoadOptions, RunOptions, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::open(&RuntimeConfig::default())?;
//!     let bytecode = std::fs::read("guest.wasm")?;
//!
//!     let handle = runtime.load(&bytecode, LoadOptions::new("main")).await?;
//!     let output = handle.run("ping", RunOptions::default()).await?;
//!     println!("{} {}", output.errno, output.response);
//!
//!     handle.close()?;
//!     runtime.close()?;
//!     Ok(())
//! }
//! ```

pub mod handle;
pub mod runtime;

pub use handle::{LoadOptions, ModuleHandle, RunOptions};
pub use runtime::Runtime;
pub use sandcall_core::RunOutput;

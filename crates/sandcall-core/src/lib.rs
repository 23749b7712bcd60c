//! Core Wasmtime runtime for sandcall.
//!
//! This crate provides the fundamental guest execution capabilities:
//! - [`CompilationCache`]: On-disk cache of compiled code
//! - [`WasmEngine`]: Configured Wasmtime engine with epoch ticker
//! - [`CompiledModule`]: Compiled module plus import/export inspection
//! - [`InvocationContext`]: Per-call state visible to host functions
//! - [`InstanceRunner`]: Drives one request through a fresh instance
//! - [`abi`]: Envelope layout, pointer packing and guest allocation tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              WasmEngine + CompilationCache              │
//! │  (One per runtime, thread-safe)                         │
//! │  - Compiled artifact cache directory                    │
//! │  - Epoch ticker                                         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           CompiledModule + InstanceRunner               │
//! │  (One per loaded module, shared across calls)           │
//! │  - Linker with env.log and the WASI shim                │
//! │  - ABI dialect fixed at load                            │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Store<InvocationContext> + Instance            │
//! │  (Per call, isolated)                                   │
//! │  - Linear memory, request/result regions                │
//! │  - Mounts, environment, log sink                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod cache;
pub mod engine;
pub mod instance;
pub mod module;
pub mod store;

pub use abi::{AbiDialect, MemoryRegion, ResultEnvelope};
pub use cache::CompilationCache;
pub use engine::WasmEngine;
pub use instance::{CallSpec, InstanceRunner, RunOutput};
pub use module::{CompiledModule, SystemInterface};
pub use store::{ExecutionMetrics, InvocationContext, LogCallback, LogLevel, StoreOptions};

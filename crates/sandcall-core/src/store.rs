//! Per-invocation execution context and store management.
//!
//! This module provides:
//! - [`InvocationContext`]: Per-call state reachable from host functions
//! - [`LogLevel`] and [`LogCallback`]: Guest log severity and the caller's sink
//! - [`ExecutionMetrics`]: Performance metrics for each call
//! - [`create_store`]: Builds a fresh, isolated store for one call

use std::sync::Arc;
use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::WasmEngine;
use sandcall_common::{ExecutionConfig, MountSpec, RuntimeError};

/// Error type a [`LogCallback`] may return.
pub type LogSinkError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-supplied sink receiving every `(level, message)` a guest logs.
///
/// It runs synchronously inside the guest's call into the host. Errors and
/// panics are logged by the host and never reach the guest.
pub type LogCallback = Arc<dyn Fn(u32, &str) -> Result<(), LogSinkError> + Send + Sync>;

/// Per-invocation execution context.
///
/// Created for each call and dropped together with its store once the call
/// completes. Host functions reach it through [`wasmtime::Caller`].
pub struct InvocationContext {
    /// WASI preview 1 context (also serves `wasi_unstable`).
    wasi: WasiP1Ctx,

    /// Memory limits enforced on the guest.
    limits: StoreLimits,

    /// Sink for guest log lines, if the module was loaded with one.
    log_callback: Option<LogCallback>,

    /// Unique invocation identifier for tracing.
    pub invocation_id: String,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    /// Execution start time.
    start_time: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during execution.
    pub fuel_consumed: u64,

    /// Number of log lines the guest emitted.
    pub log_count: u64,

    /// Total execution duration.
    pub duration: Option<Duration>,
}

/// Per-call inputs that shape the sandbox.
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Unique invocation identifier.
    pub invocation_id: String,

    /// Host directories visible to the guest.
    pub mounts: Vec<MountSpec>,

    /// Environment variables visible to the guest.
    pub env: Vec<(String, String)>,

    /// Sink for guest log lines.
    pub log_callback: Option<LogCallback>,
}

impl InvocationContext {
    /// Create a new context around an already built WASI context.
    pub fn new(
        invocation_id: String,
        wasi: WasiP1Ctx,
        limits: StoreLimits,
        log_callback: Option<LogCallback>,
    ) -> Self {
        Self {
            wasi,
            limits,
            log_callback,
            invocation_id,
            metrics: ExecutionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Get the WASI context.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Get the registered log sink, if any.
    pub fn log_callback(&self) -> Option<&LogCallback> {
        self.log_callback.as_ref()
    }

    /// Finalize metrics after execution.
    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.start_time.elapsed());
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("has_log_callback", &self.log_callback.is_some())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Build the WASI context for one call.
///
/// Randomness, clocks and sleep are always available; mounts and environment
/// variables come from `options`.
fn build_wasi(
    config: &ExecutionConfig,
    options: &StoreOptions,
) -> Result<WasiP1Ctx, RuntimeError> {
    let mut builder = WasiCtxBuilder::new();

    if config.inherit_stdio {
        builder.inherit_stdout().inherit_stderr();
    }

    for (key, value) in &options.env {
        builder.env(key, value);
    }

    for mount in &options.mounts {
        let (dir_perms, file_perms) = if mount.read_only {
            (DirPerms::READ, FilePerms::READ)
        } else {
            (DirPerms::all(), FilePerms::all())
        };

        builder
            .preopened_dir(&mount.host_path, &mount.guest_path, dir_perms, file_perms)
            .map_err(|e| RuntimeError::invalid_mount(mount.to_string(), e.to_string()))?;
    }

    Ok(builder.build_p1())
}

/// Create a new Wasmtime store for a single call.
///
/// # Errors
///
/// Returns an error if a mount cannot be opened or fuel cannot be set.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    options: StoreOptions,
) -> Result<Store<InvocationContext>, RuntimeError> {
    let wasi = build_wasi(config, &options)?;
    let limits = StoreLimitsBuilder::new()
        .memory_size(config.max_memory_bytes())
        .build();

    let context = InvocationContext::new(options.invocation_id, wasi, limits, options.log_callback);
    let mut store = Store::new(engine.inner(), context);
    store.limiter(|ctx| &mut ctx.limits);

    // The engine always consumes fuel; without metering give the guest all of it.
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    // Yield back to the host on every tick so deadlines can fire.
    if engine.config().epoch_interruption {
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<InvocationContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<InvocationContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}

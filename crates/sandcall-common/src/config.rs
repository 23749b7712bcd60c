//! Configuration structures for sandcall.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, caching, epochs)
//! - [`ExecutionConfig`]: Per-call execution limits (fuel, memory, deadline)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the engine shared by every module loaded into one
/// runtime, including memory allocation strategy and compilation caching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for fast instance creation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable the on-disk cache of compiled code.
    #[serde(default = "defaults::cache_compiled_modules")]
    pub cache_compiled_modules: bool,

    /// Base directory for the compiled code cache.
    ///
    /// Each runtime creates its own uniquely named subdirectory here and
    /// removes it on close.
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Enable epoch-based interruption.
    ///
    /// Guests yield back to the host on every epoch tick, which is what lets
    /// deadlines and cancellation stop a busy guest.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_interval_ms")]
    pub epoch_tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            cache_compiled_modules: defaults::cache_compiled_modules(),
            cache_dir: Some("./cache".into()),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_interval_ms: defaults::epoch_tick_interval_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick_interval(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_interval_ms.max(1))
    }
}

/// Per-call execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per call.
    ///
    /// Only enforced when `fuel_metering` is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Default deadline in milliseconds for calls that do not supply one.
    ///
    /// `0` disables the default deadline.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory per instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Let guests write to the host's stdout and stderr.
    #[serde(default = "defaults::inherit_stdio")]
    pub inherit_stdio: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            inherit_stdio: defaults::inherit_stdio(),
        }
    }
}

impl ExecutionConfig {
    /// Get the default deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Get the linear memory cap in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Argument shape of the guest entry point.
///
/// Both shapes pass the result envelope pointer followed by the request
/// pointer and length. `WithIdentifier` prepends a caller-assigned numeric
/// identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryPointShape {
    /// `entry(result_ptr, request_ptr, request_len)`
    #[default]
    Default,
    /// `entry(id, result_ptr, request_ptr, request_len)`
    WithIdentifier,
}

impl EntryPointShape {
    /// Number of parameters the entry point takes.
    pub const fn arity(self) -> usize {
        match self {
            Self::Default => 3,
            Self::WithIdentifier => 4,
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn cache_compiled_modules() -> bool {
        true
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_interval_ms() -> u64 {
        1
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn timeout_ms() -> u64 {
        0
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub const fn inherit_stdio() -> bool {
        true
    }
}

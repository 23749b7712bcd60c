//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every module loaded into one runtime. It is:
//! - Thread-safe and cheap to clone
//! - Optionally backed by an on-disk [`CompilationCache`]
//! - Set up with fuel metering and epoch interruption for resource limiting
//!
//! When epoch interruption is enabled the engine owns a background ticker
//! thread that advances the epoch. Guests yield to the host on every tick,
//! which lets deadlines and cancellation reach code stuck in a loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use crate::cache::CompilationCache;
use sandcall_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: Guest calls run on fibers so they can be abandoned
/// - **Fuel Metering**: Enables deterministic CPU limiting
/// - **Epoch Interruption**: Periodic yields for deadlines and cancellation
/// - **Pooling Allocator** (optional): Pre-allocated instance slots
/// - **Compilation Cache** (optional): Reuse of compiled code across loads
///
/// # Example
///
/// ```ignore
/// use sandcall_common::EngineConfig;
/// use sandcall_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default(), None)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
    ticker: Arc<Mutex<Option<EpochTicker>>>,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The cache configuration cannot be loaded
    /// - The epoch ticker thread cannot be spawned
    pub fn new(
        config: &EngineConfig,
        cache: Option<&CompilationCache>,
    ) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        if let Some(cache) = cache {
            wasmtime_config
                .cache_config_load(cache.config_path())
                .map_err(|e| {
                    RuntimeError::invalid_config(format!(
                        "Failed to load compilation cache configuration: {e}"
                    ))
                })?;

            debug!(cache_dir = %cache.directory().display(), "Compilation cache attached");
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let ticker = if config.epoch_interruption {
            Some(EpochTicker::start(engine.clone(), config.epoch_tick_interval())?)
        } else {
            None
        };

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
            ticker: Arc::new(Mutex::new(ticker)),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);
        pooling.total_stacks(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Check if the epoch ticker is running.
    pub fn is_ticking(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Stop the epoch ticker.
    ///
    /// Guests still running after this no longer yield, so only call it once
    /// no invocations are in flight. Calling it twice is harmless.
    pub fn shutdown(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("instance_memory_mb", &self.config.instance_memory_mb)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .finish_non_exhaustive()
    }
}

/// Background thread advancing an engine's epoch at a fixed interval.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> Result<Self, RuntimeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("sandcall-epoch".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;

        debug!(interval_ms = interval.as_millis(), "Epoch ticker started");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("Epoch ticker stopped");
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_engine_creation_default() {
        let engine = WasmEngine::new(&EngineConfig::default(), None);

        assert!(engine.is_ok());
        let engine = engine.unwrap();
        assert!(engine.is_pooling_enabled());
        assert!(engine.is_ticking());
    }

    #[test]
    fn test_engine_creation_no_pooling() {
        let engine = WasmEngine::new(&test_config(), None).unwrap();
        assert!(!engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_without_epochs_has_no_ticker() {
        let config = EngineConfig {
            epoch_interruption: false,
            ..test_config()
        };
        let engine = WasmEngine::new(&config, None).unwrap();
        assert!(!engine.is_ticking());
    }

    #[test]
    fn test_engine_shutdown_is_idempotent() {
        let engine = WasmEngine::new(&test_config(), None).unwrap();

        engine.shutdown();
        assert!(!engine.is_ticking());
        engine.shutdown();

        // Manual increments still work after the ticker is gone.
        engine.inner().increment_epoch();
    }

    #[test]
    fn test_engine_with_cache() {
        let base = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(base.path()).unwrap();

        let engine = WasmEngine::new(&test_config(), Some(&cache));
        assert!(engine.is_ok());

        drop(engine);
        cache.close().unwrap();
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&test_config(), None).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("pooling_allocator"));
    }
}

//! Guest invocation.
//!
//! This module provides [`InstanceRunner`], which drives one request through
//! a fresh instance of a compiled module:
//!
//! 1. Instantiate the module into the caller's store and resolve its exports
//! 2. Run the guest's `init`
//! 3. Copy the request into guest memory and reserve the result envelope
//! 4. Call the entry point
//! 5. Decode the envelope and read the response text
//! 6. Free every guest allocation, whatever happened above

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use wasmtime::{Engine, Instance, Linker, Store, Trap};

use crate::CompiledModule;
use crate::abi::{
    AbiDialect, ENVELOPE_SIZE, GuestFunc, GuestMemory, MemoryRegion, ReleaseStack,
    ResultEnvelope,
};
use crate::module::VERSION_EXPORT;
use crate::store::{ExecutionMetrics, InvocationContext, calculate_fuel_consumed, get_remaining_fuel};
use sandcall_common::{EntryPointShape, RuntimeError};

/// Name of the guest's one-time setup export.
pub const INIT_EXPORT: &str = "init";

/// Name of the guest's allocator export.
pub const MALLOC_EXPORT: &str = "malloc";

/// Name of the guest's deallocator export.
pub const FREE_EXPORT: &str = "free";

/// How to call a module's entry point.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Name of the exported entry point.
    pub entry_point: String,

    /// Argument shape of the entry point.
    pub shape: EntryPointShape,

    /// Calling dialect detected at load time.
    pub dialect: AbiDialect,

    /// Identifier passed first when `shape` is [`EntryPointShape::WithIdentifier`].
    pub call_id: u64,
}

/// Outcome of a completed call.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Status code reported by the guest.
    pub errno: u64,

    /// Response text reported by the guest.
    pub response: String,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,
}

/// Exports every call resolves before touching guest memory.
struct GuestExports {
    memory: GuestMemory,
    init: GuestFunc,
    entry: GuestFunc,
    malloc: GuestFunc,
    free: GuestFunc,
}

impl GuestExports {
    fn resolve(
        store: &mut Store<InvocationContext>,
        instance: &Instance,
        entry_point: &str,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            memory: GuestMemory::resolve(&mut *store, instance)?,
            init: GuestFunc::resolve(&mut *store, instance, INIT_EXPORT)?,
            entry: GuestFunc::resolve(&mut *store, instance, entry_point)?,
            malloc: GuestFunc::resolve(&mut *store, instance, MALLOC_EXPORT)?,
            free: GuestFunc::resolve(&mut *store, instance, FREE_EXPORT)?,
        })
    }

    /// Allocate `size` bytes in the guest and record the region for release.
    ///
    /// Returns `None` for a zero-sized request the guest answered with null.
    async fn allocate(
        &self,
        store: &mut Store<InvocationContext>,
        size: u32,
        releases: &mut ReleaseStack,
    ) -> Result<Option<MemoryRegion>, RuntimeError> {
        let results = self
            .malloc
            .call(&mut *store, &[u64::from(size)])
            .await
            .map_err(classify_trap)?;

        let ptr = results.first().copied().ok_or_else(|| {
            RuntimeError::execution_failed(format!("`{MALLOC_EXPORT}` returned no pointer"))
        })?;

        if ptr == 0 {
            if size == 0 {
                return Ok(None);
            }
            return Err(RuntimeError::AllocationFailed {
                size: u64::from(size),
            });
        }

        let offset = u32::try_from(ptr).map_err(|_| {
            RuntimeError::execution_failed(format!(
                "`{MALLOC_EXPORT}` returned out-of-range pointer {ptr}"
            ))
        })?;

        let region = MemoryRegion::new(offset, size);
        releases.push(region);
        Ok(Some(region))
    }
}

/// Instance lifecycle manager.
///
/// Holds the linker every call instantiates through. Host functions and the
/// system interface shim are registered on it once, before the first call.
///
/// # Thread Safety
///
/// `InstanceRunner` is thread-safe and can be shared across multiple tasks.
/// Each call uses its own [`Store`] for isolation.
pub struct InstanceRunner {
    engine: Engine,
    linker: Linker<InvocationContext>,
}

impl InstanceRunner {
    /// Create a new instance runner with an empty linker.
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            linker: Linker::new(engine),
        }
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<InvocationContext> {
        &mut self.linker
    }

    /// Get the engine reference.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    async fn instantiate(
        &self,
        module: &CompiledModule,
        store: &mut Store<InvocationContext>,
    ) -> Result<Instance, RuntimeError> {
        self.linker
            .instantiate_async(&mut *store, module.as_module())
            .await
            .map_err(|e| RuntimeError::instantiation_failed(e.to_string()))
    }

    /// Determine the calling dialect of a module.
    ///
    /// Modules without a `ver` probe use [`AbiDialect::Default`] and are not
    /// instantiated. Otherwise `ver` is called once in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe instance cannot be created or `ver`
    /// traps.
    #[instrument(skip_all)]
    pub async fn probe_dialect(
        &self,
        module: &CompiledModule,
        store: &mut Store<InvocationContext>,
    ) -> Result<AbiDialect, RuntimeError> {
        if !module.has_version_probe() {
            debug!("No version probe exported, using default dialect");
            return Ok(AbiDialect::Default);
        }

        let instance = self.instantiate(module, store).await?;
        let ver = GuestFunc::resolve(&mut *store, &instance, VERSION_EXPORT)?;
        let results = ver.call(&mut *store, &[]).await.map_err(classify_trap)?;
        let version = results.first().copied().unwrap_or_default();

        let dialect = AbiDialect::from_version(version);
        info!(version, dialect = %dialect, "ABI dialect detected");
        Ok(dialect)
    }

    /// Run one request against a fresh instance of `module`.
    ///
    /// Every guest allocation made along the way is freed before this
    /// returns, whether the call succeeded or not. Release failures are
    /// logged and do not replace the call's own result.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Instantiation fails or a required export is missing
    /// - `init` or the entry point traps
    /// - The guest's allocator fails
    /// - The result envelope or response lies outside guest memory
    #[instrument(skip(self, module, store, request), fields(entry_point = %call.entry_point, request_len = request.len()))]
    pub async fn invoke(
        &self,
        module: &CompiledModule,
        store: &mut Store<InvocationContext>,
        request: &str,
        call: &CallSpec,
    ) -> Result<RunOutput, RuntimeError> {
        let start = Instant::now();
        let initial_fuel = get_remaining_fuel(store).unwrap_or(0);

        debug!("Instantiating module");
        let instance = self.instantiate(module, store).await?;
        let exports = GuestExports::resolve(store, &instance, &call.entry_point)?;

        if exports.entry.arity() != call.shape.arity() {
            return Err(RuntimeError::instantiation_failed(format!(
                "entry point `{}` takes {} argument(s), the {:?} shape passes {}",
                call.entry_point,
                exports.entry.arity(),
                call.shape,
                call.shape.arity()
            )));
        }

        exports
            .init
            .call(&mut *store, &[])
            .await
            .map_err(classify_trap)?;

        let mut releases = ReleaseStack::new();
        let outcome = Self::exchange(&exports, store, request, call, &mut releases).await;

        let failed = releases.unwind(&mut *store, &exports.free, call.dialect).await;
        if failed > 0 {
            warn!(failed, "Some guest regions could not be released");
        }

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, store);
        store.data_mut().metrics.fuel_consumed = fuel_consumed;
        store.data_mut().finalize_metrics();
        let metrics = store.data().metrics.clone();
        let duration = start.elapsed();

        match outcome {
            Ok((errno, response)) => {
                info!(
                    errno,
                    response_len = response.len(),
                    duration_ms = duration.as_millis(),
                    fuel_consumed = metrics.fuel_consumed,
                    "Invocation completed"
                );
                Ok(RunOutput {
                    errno,
                    response,
                    metrics,
                })
            }
            Err(e) => {
                error!(
                    error = %e,
                    duration_ms = duration.as_millis(),
                    "Invocation failed"
                );
                Err(e)
            }
        }
    }

    /// Steps between allocation and release: write the request, call the
    /// entry point, read the result. Every allocation lands on `releases`
    /// before anything that could fail after it.
    async fn exchange(
        exports: &GuestExports,
        store: &mut Store<InvocationContext>,
        request: &str,
        call: &CallSpec,
        releases: &mut ReleaseStack,
    ) -> Result<(u64, String), RuntimeError> {
        let request_bytes = request.as_bytes();
        let request_len = u32::try_from(request_bytes.len()).map_err(|_| {
            RuntimeError::invalid_config(format!(
                "request of {} bytes does not fit in guest memory",
                request_bytes.len()
            ))
        })?;

        let request_region = exports.allocate(store, request_len, releases).await?;
        let request_offset = match request_region {
            Some(region) => {
                exports.memory.write(&mut *store, region.offset, request_bytes)?;
                region.offset
            }
            None => 0,
        };

        #[allow(clippy::cast_possible_truncation)]
        let result_region = exports
            .allocate(store, ENVELOPE_SIZE as u32, releases)
            .await?
            .ok_or(RuntimeError::AllocationFailed {
                size: ENVELOPE_SIZE as u64,
            })?;

        let mut args = Vec::with_capacity(call.shape.arity());
        if call.shape == EntryPointShape::WithIdentifier {
            args.push(call.call_id);
        }
        args.extend([
            u64::from(result_region.offset),
            u64::from(request_offset),
            u64::from(request_len),
        ]);

        debug!("Calling entry point");
        exports
            .entry
            .call(&mut *store, &args)
            .await
            .map_err(classify_trap)?;

        let envelope_bytes = exports.memory.read_available(&*store, result_region);
        let envelope = ResultEnvelope::decode(&envelope_bytes)?;

        let response = match envelope.response_region() {
            None => String::new(),
            Some(region) => {
                releases.push(region);
                let bytes = exports.memory.read(&*store, region)?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };

        Ok((envelope.errno, response))
    }
}

/// Map an engine error from a guest call to a [`RuntimeError`].
fn classify_trap(error: wasmtime::Error) -> RuntimeError {
    if error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
    {
        return RuntimeError::FuelExhausted;
    }

    let message = match error.downcast_ref::<Trap>() {
        Some(trap) => format!("{error} ({trap:?})"),
        None => error.to_string(),
    };
    RuntimeError::execution_failed(message)
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use crate::store::{StoreOptions, create_store};
    use sandcall_common::{EngineConfig, ExecutionConfig};

    #[test]
    fn test_probe_skips_modules_without_version() {
        let config = EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config, None).unwrap();
        // Unresolvable import: instantiating this module would fail.
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"(module (import "nowhere" "f" (func)))"#,
        )
        .unwrap();
        let runner = InstanceRunner::new(engine.inner());
        let mut store =
            create_store(&engine, &ExecutionConfig::default(), StoreOptions::default()).unwrap();

        let dialect = tokio_test::block_on(runner.probe_dialect(&module, &mut store)).unwrap();
        assert_eq!(dialect, AbiDialect::Default);
    }

    #[test]
    fn test_classify_out_of_fuel() {
        let err = classify_trap(wasmtime::Error::from(Trap::OutOfFuel));
        assert!(matches!(err, RuntimeError::FuelExhausted));
    }

    #[test]
    fn test_classify_trap() {
        let err = classify_trap(wasmtime::Error::from(Trap::UnreachableCodeReached));
        match err {
            RuntimeError::ExecutionFailed { message } => {
                assert!(message.contains("UnreachableCodeReached"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_host_error() {
        let err = classify_trap(anyhow::anyhow!("host said no"));
        assert!(matches!(err, RuntimeError::ExecutionFailed { .. }));
        assert!(err.to_string().contains("host said no"));
    }
}

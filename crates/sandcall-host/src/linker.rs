//! Host function registration for Wasmtime linkers.
//!
//! This module provides functions to register host functions and the WASI
//! shim on Wasmtime linkers, enabling WebAssembly modules to call into the
//! host runtime.

use sandcall_common::RuntimeError;
use sandcall_core::store::InvocationContext;
use sandcall_core::{CompiledModule, InstanceRunner, SystemInterface, WasmEngine};
use tracing::{debug, error};
use wasmtime::{Caller, Linker};
use wasmtime_wasi::{preview0, preview1};

use crate::logging::LoggingHost;

/// Register all host functions a module may import.
///
/// This registers:
/// - `env::log` - Logging function for guest code
/// - The WASI shim matching `interface`, if any
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(
    linker: &mut Linker<InvocationContext>,
    interface: SystemInterface,
) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    register_system_interface(linker, interface)?;
    Ok(())
}

/// Build an [`InstanceRunner`] whose linker satisfies `module`'s imports.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn build_runner(
    engine: &WasmEngine,
    module: &CompiledModule,
) -> Result<InstanceRunner, RuntimeError> {
    let mut runner = InstanceRunner::new(engine.inner());
    register_all(runner.linker_mut(), module.system_interface())?;
    Ok(runner)
}

/// Register the logging host function.
///
/// Registers `env::log(level: i32, ptr: i32, len: i32)` which allows guest
/// code to emit logs at various levels (debug, info, warn, error).
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Offset of the message in the guest's exported `memory`
/// - `len`: Length of the message in bytes (UTF-8)
///
/// A span that cannot be read is logged as an error and the guest call
/// returns normally.
///
/// # Errors
///
/// Returns an error if the function is already defined on `linker`.
pub fn register_logging(linker: &mut Linker<InvocationContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, InvocationContext>, level: i32, ptr: i32, len: i32| {
                #[allow(clippy::cast_sign_loss)]
                let (level, ptr, len) = (level as u32, ptr as u32, len as u32);

                let Some(memory) = caller
                    .get_export("memory")
                    .and_then(wasmtime::Extern::into_memory)
                else {
                    error!(ptr, len, "Guest log dropped: memory export not found");
                    return;
                };

                // Copy out before borrowing the context mutably.
                let message = {
                    let data = memory.data(&caller);
                    let start = ptr as usize;
                    let end = start.checked_add(len as usize);

                    match end.and_then(|end| data.get(start..end)) {
                        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                        None => {
                            error!(
                                ptr,
                                len,
                                memory_size = data.len(),
                                "Guest log dropped: span out of bounds"
                            );
                            return;
                        }
                    }
                };

                LoggingHost::log(caller.data_mut(), level, &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register the WASI shim a module imports.
///
/// `wasi_unstable` is served by the preview 0 adapter, which exposes the
/// preview 1 implementation under the legacy module name.
///
/// # Errors
///
/// Returns an error if the shim's functions cannot be defined on `linker`.
pub fn register_system_interface(
    linker: &mut Linker<InvocationContext>,
    interface: SystemInterface,
) -> Result<(), RuntimeError> {
    let result = match interface {
        SystemInterface::None => return Ok(()),
        SystemInterface::Standard => {
            preview1::add_to_linker_async(linker, |ctx: &mut InvocationContext| ctx.wasi_mut())
        }
        SystemInterface::LegacyUnstable => {
            preview0::add_to_linker_async(linker, |ctx: &mut InvocationContext| ctx.wasi_mut())
        }
    };

    result.map_err(|e| {
        RuntimeError::invalid_config(format!("Failed to register {interface} shim: {e}"))
    })?;

    debug!(%interface, "System interface registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcall_common::{EngineConfig, ExecutionConfig};
    use sandcall_core::store::{StoreOptions, create_store};

    fn engine() -> WasmEngine {
        let config = EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        };
        WasmEngine::new(&config, None).unwrap()
    }

    #[test]
    fn test_register_logging() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        assert!(register_logging(&mut linker).is_ok());
    }

    #[test]
    fn test_register_logging_twice_fails() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        register_logging(&mut linker).unwrap();
        let err = register_logging(&mut linker).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_register_all_interfaces() {
        let engine = engine();

        for interface in [
            SystemInterface::None,
            SystemInterface::Standard,
            SystemInterface::LegacyUnstable,
        ] {
            let mut linker = Linker::new(engine.inner());
            assert!(register_all(&mut linker, interface).is_ok(), "{interface}");
        }
    }

    /// Instantiate `wat` and call its `run` export, returning the log count.
    fn run_guest(wat: &str) -> u64 {
        let engine = engine();
        let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
        let mut linker = Linker::new(engine.inner());
        register_all(&mut linker, SystemInterface::None).unwrap();
        let mut store = create_store(
            &engine,
            &ExecutionConfig::default(),
            StoreOptions::default(),
        )
        .unwrap();

        tokio_test::block_on(async {
            let instance = linker
                .instantiate_async(&mut store, module.as_module())
                .await
                .unwrap();
            let run = instance
                .get_typed_func::<(), ()>(&mut store, "run")
                .unwrap();
            run.call_async(&mut store, ()).await.unwrap();
        });

        store.data().metrics.log_count
    }

    #[test]
    fn test_guest_log_reaches_host() {
        let wat = r#"
            (module
                (import "env" "log" (func $log (param i32 i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 0) "Hello from Wasm")
                (func (export "run")
                    (call $log (i32.const 1) (i32.const 0) (i32.const 15))
                    (call $log (i32.const 7) (i32.const 0) (i32.const 5))))
        "#;
        assert_eq!(run_guest(wat), 2);
    }

    #[test]
    fn test_unreadable_log_span_does_not_trap() {
        let wat = r#"
            (module
                (import "env" "log" (func $log (param i32 i32 i32)))
                (memory (export "memory") 1)
                (func (export "run")
                    (call $log (i32.const 1) (i32.const 65530) (i32.const 100))
                    (call $log (i32.const 1) (i32.const -1) (i32.const -1))))
        "#;
        assert_eq!(run_guest(wat), 0);
    }

    #[test]
    fn test_log_without_memory_does_not_trap() {
        let wat = r#"
            (module
                (import "env" "log" (func $log (param i32 i32 i32)))
                (func (export "run")
                    (call $log (i32.const 1) (i32.const 0) (i32.const 1))))
        "#;
        assert_eq!(run_guest(wat), 0);
    }

    #[test]
    fn test_build_runner_for_module() {
        let engine = engine();
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"(module (import "wasi_snapshot_preview1" "random_get" (func (param i32 i32) (result i32))))"#,
        )
        .unwrap();

        assert!(build_runner(&engine, &module).is_ok());
    }
}

//! WebAssembly module compilation and inspection.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's
//! [`Module`] that is compiled once at load time and then shared by every
//! invocation. Besides compilation it answers the questions the loader asks
//! before the first call:
//! - which system interface the guest imports ([`SystemInterface`])
//! - whether the guest exports a `ver` probe for ABI dialect detection

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::{Duration, Instant};

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module, ValType};

use sandcall_common::RuntimeError;

/// Name of the optional export probed to pick the ABI dialect.
pub const VERSION_EXPORT: &str = "ver";

/// Import module name of WASI preview 1.
pub const WASI_PREVIEW1: &str = "wasi_snapshot_preview1";

/// Import module name of the legacy, pre-snapshot WASI.
pub const WASI_UNSTABLE: &str = "wasi_unstable";

/// System interface shim a guest expects to find at instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemInterface {
    /// The guest imports no system interface.
    None,
    /// `wasi_snapshot_preview1`.
    Standard,
    /// `wasi_unstable`.
    LegacyUnstable,
}

impl SystemInterface {
    /// Detect the system interface from a module's import module names.
    ///
    /// The standard name wins when a module somehow imports both.
    pub fn detect<'a>(import_modules: impl IntoIterator<Item = &'a str>) -> Self {
        let mut found = Self::None;
        for name in import_modules {
            match name {
                WASI_PREVIEW1 => return Self::Standard,
                WASI_UNSTABLE => found = Self::LegacyUnstable,
                _ => {}
            }
        }
        found
    }
}

impl std::fmt::Display for SystemInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemInterface::None => write!(f, "none"),
            SystemInterface::Standard => write!(f, "{WASI_PREVIEW1}"),
            SystemInterface::LegacyUnstable => write!(f, "{WASI_UNSTABLE}"),
        }
    }
}

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across concurrent
/// invocations; every invocation instantiates it into its own store.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// How long compilation took.
    compile_duration: Duration,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid Wasm binary or fail to
    /// compile.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        Self::validate_wasm_header(bytes)?;
        Self::compile(engine, bytes)
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        Self::compile(engine, wat.as_bytes())
    }

    fn compile(engine: &Engine, source: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, source).map_err(|e| {
            RuntimeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(source);
        let compile_duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            duration_ms = compile_duration.as_millis(),
            "Module compiled"
        );

        Ok(Self {
            module,
            content_hash,
            compile_duration,
        })
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get how long compilation took.
    pub fn compile_duration(&self) -> Duration {
        self.compile_duration
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.module
    }

    /// Names of all exports, in declaration order.
    pub fn export_names(&self) -> Vec<String> {
        self.module.exports().map(|e| e.name().to_string()).collect()
    }

    /// Check whether the module exports a function with the given name.
    pub fn exports_function(&self, name: &str) -> bool {
        matches!(
            self.module.get_export(name),
            Some(ExternType::Func(_))
        )
    }

    /// The system interface this module imports.
    pub fn system_interface(&self) -> SystemInterface {
        SystemInterface::detect(self.module.imports().map(|i| i.module()))
    }

    /// Check whether the module exports a usable `ver` probe: a function with
    /// no parameters and a single integer result.
    pub fn has_version_probe(&self) -> bool {
        let Some(ExternType::Func(ty)) = self.module.get_export(VERSION_EXPORT) else {
            return false;
        };

        let mut results = ty.results();
        ty.params().len() == 0
            && results.len() == 1
            && results
                .next()
                .is_some_and(|r| matches!(r, ValType::I32 | ValType::I64))
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("system_interface", &self.system_interface())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use sandcall_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        let config = EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        };
        WasmEngine::new(&config, None).unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(CompiledModule::validate_wasm_header(&[0x00, 0x61]).is_err());

        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(CompiledModule::validate_wasm_header(bad_wasm).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_module_compilation() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();

        assert!(!module.content_hash().is_empty());
        assert!(module.export_names().is_empty());
        assert_eq!(module.system_interface(), SystemInterface::None);
    }

    #[test]
    fn test_compile_failure() {
        let engine = engine();
        let err = CompiledModule::from_wat(engine.inner(), "(module (func (export")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
        assert!(err.is_setup());
    }

    #[test]
    fn test_detect_system_interface() {
        assert_eq!(SystemInterface::detect([]), SystemInterface::None);
        assert_eq!(SystemInterface::detect(["env"]), SystemInterface::None);
        assert_eq!(
            SystemInterface::detect(["env", WASI_PREVIEW1]),
            SystemInterface::Standard
        );
        assert_eq!(
            SystemInterface::detect([WASI_UNSTABLE, "env"]),
            SystemInterface::LegacyUnstable
        );
        assert_eq!(
            SystemInterface::detect([WASI_UNSTABLE, WASI_PREVIEW1]),
            SystemInterface::Standard
        );
    }

    #[test]
    fn test_system_interface_from_imports() {
        let engine = engine();
        let wat = r#"
            (module
                (import "wasi_unstable" "random_get" (func (param i32 i32) (result i32)))
            )
        "#;
        let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
        assert_eq!(module.system_interface(), SystemInterface::LegacyUnstable);
    }

    #[test]
    fn test_version_probe_detection() {
        let engine = engine();

        let with_probe = CompiledModule::from_wat(
            engine.inner(),
            r#"(module (func (export "ver") (result i32) i32.const 1))"#,
        )
        .unwrap();
        assert!(with_probe.has_version_probe());
        assert!(with_probe.exports_function("ver"));

        let wrong_shape = CompiledModule::from_wat(
            engine.inner(),
            r#"(module (func (export "ver") (param i32) (result i32) local.get 0))"#,
        )
        .unwrap();
        assert!(!wrong_shape.has_version_probe());

        let without = CompiledModule::from_wat(engine.inner(), "(module)").unwrap();
        assert!(!without.has_version_probe());
        assert!(!without.exports_function("ver"));
    }

    #[test]
    fn test_module_debug() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("content_hash"));
    }
}

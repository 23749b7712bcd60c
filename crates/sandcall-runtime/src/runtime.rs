//! Runtime lifecycle.
//!
//! This module provides [`Runtime`], which holds the resources shared by
//! every module it loads: the Wasmtime engine with its epoch ticker and the
//! on-disk compilation cache.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use sandcall_common::{ExecutionConfig, RuntimeConfig, RuntimeError};
use sandcall_core::{CompilationCache, CompiledModule, WasmEngine};

use crate::handle::{LoadOptions, ModuleHandle};

/// Shared engine and compilation cache.
///
/// Cloning is cheap; every clone and every [`ModuleHandle`] loaded from it
/// refers to the same engine. The cache directory is removed by
/// [`Runtime::close`], or when the last reference is dropped if `close` was
/// never reached.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    engine: WasmEngine,
    cache: Option<CompilationCache>,
    execution: ExecutionConfig,
}

impl RuntimeInner {
    fn shutdown(&mut self) -> Result<(), RuntimeError> {
        self.engine.shutdown();
        match self.cache.take() {
            Some(cache) => cache.close(),
            None => Ok(()),
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Runtime cleanup failed");
        }
    }
}

impl Runtime {
    /// Open a runtime.
    ///
    /// A compilation cache is created under `engine.cache_dir` when
    /// `engine.cache_compiled_modules` is set and a directory is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The cache directory is empty or cannot be created
    /// - The engine cannot be built from the configuration
    pub fn open(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let cache = match (&config.engine.cache_dir, config.engine.cache_compiled_modules) {
            (Some(dir), true) => Some(CompilationCache::open(dir)?),
            _ => None,
        };

        let engine = match WasmEngine::new(&config.engine, cache.as_ref()) {
            Ok(engine) => engine,
            Err(e) => {
                if let Some(Err(cleanup)) = cache.map(CompilationCache::close) {
                    warn!(error = %cleanup, "Failed to remove cache after engine error");
                }
                return Err(e);
            }
        };

        info!(
            cache_dir = ?cache.as_ref().map(|c| c.directory().display().to_string()),
            pooling = engine.is_pooling_enabled(),
            "Runtime opened"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                engine,
                cache,
                execution: config.execution.clone(),
            }),
        })
    }

    /// Compile a module and prepare it for calls.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The bytes are not a valid module or fail to compile
    /// - Host functions cannot be registered for the module
    /// - The `ver` probe cannot be run
    #[instrument(skip(self, bytecode, options), fields(bytes_len = bytecode.len(), entry_point = %options.entry_point))]
    pub async fn load(
        &self,
        bytecode: &[u8],
        options: LoadOptions,
    ) -> Result<ModuleHandle, RuntimeError> {
        let engine = self.engine().inner().clone();
        let bytecode = bytecode.to_vec();
        let module = self
            .compile_blocking(move || CompiledModule::from_bytes(&engine, &bytecode))
            .await?;
        ModuleHandle::prepare(self.clone(), module, options, false).await
    }

    /// Compile a module from WAT text and prepare it for calls.
    ///
    /// # Errors
    ///
    /// Same as [`Runtime::load`].
    #[instrument(skip(self, wat, options), fields(entry_point = %options.entry_point))]
    pub async fn load_wat(
        &self,
        wat: &str,
        options: LoadOptions,
    ) -> Result<ModuleHandle, RuntimeError> {
        let engine = self.engine().inner().clone();
        let wat = wat.to_string();
        let module = self
            .compile_blocking(move || CompiledModule::from_wat(&engine, &wat))
            .await?;
        ModuleHandle::prepare(self.clone(), module, options, false).await
    }

    /// Run a compilation on tokio's blocking pool.
    pub(crate) async fn compile_blocking<F>(
        &self,
        compile: F,
    ) -> Result<CompiledModule, RuntimeError>
    where
        F: FnOnce() -> Result<CompiledModule, RuntimeError> + Send + 'static,
    {
        tokio::task::spawn_blocking(compile)
            .await
            .map_err(|e| RuntimeError::compilation_failed(format!("compile task failed: {e}")))?
    }

    /// Get the engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.inner.engine
    }

    /// Get the execution configuration applied to every call.
    pub fn exec_config(&self) -> &ExecutionConfig {
        &self.inner.execution
    }

    /// Directory of the compilation cache, if one is attached.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.inner.cache.as_ref().map(CompilationCache::directory)
    }

    /// Stop the epoch ticker and remove the compilation cache.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StillInUse`] if other clones or module handles
    /// are alive; cleanup then happens once the last of them is dropped.
    /// Returns [`RuntimeError::Cleanup`] if the cache could not be removed.
    pub fn close(self) -> Result<(), RuntimeError> {
        let mut inner = Arc::try_unwrap(self.inner).map_err(|inner| {
            RuntimeError::StillInUse {
                references: Arc::strong_count(&inner) - 1,
            }
        })?;

        let result = inner.shutdown();
        info!("Runtime closed");
        result
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.inner.engine)
            .field("cache_dir", &self.cache_dir())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcall_common::EngineConfig;

    fn config(cache_dir: Option<String>) -> RuntimeConfig {
        RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                cache_dir,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_open_without_cache() {
        let runtime = Runtime::open(&config(None)).unwrap();
        assert!(runtime.cache_dir().is_none());
        assert!(runtime.engine().is_ticking());
        runtime.close().unwrap();
    }

    #[test]
    fn test_open_with_cache() {
        let base = tempfile::tempdir().unwrap();
        let runtime =
            Runtime::open(&config(Some(base.path().display().to_string()))).unwrap();

        let dir = runtime.cache_dir().unwrap().to_path_buf();
        assert!(dir.is_dir());
        assert!(dir.starts_with(base.path().canonicalize().unwrap()));

        runtime.close().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_open_rejects_empty_cache_dir() {
        let err = Runtime::open(&config(Some(String::new()))).unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyCacheDirectory));
    }

    #[test]
    fn test_cache_disabled_by_flag() {
        let base = tempfile::tempdir().unwrap();
        let mut config = config(Some(base.path().display().to_string()));
        config.engine.cache_compiled_modules = false;

        let runtime = Runtime::open(&config).unwrap();
        assert!(runtime.cache_dir().is_none());
    }

    #[tokio::test]
    async fn test_load_reports_compile_errors() {
        let runtime = Runtime::open(&config(None)).unwrap();
        let err = runtime
            .load(b"\0asm\x01\0\0\0\x7f", LoadOptions::new("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
    }

    #[tokio::test]
    async fn test_compile_task_panic_is_reported() {
        let runtime = Runtime::open(&config(None)).unwrap();
        let err = runtime
            .compile_blocking(|| panic!("compiler crashed"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
    }

    #[test]
    fn test_close_with_clone_alive() {
        let base = tempfile::tempdir().unwrap();
        let runtime =
            Runtime::open(&config(Some(base.path().display().to_string()))).unwrap();
        let dir = runtime.cache_dir().unwrap().to_path_buf();
        let other = runtime.clone();

        let err = runtime.close().unwrap_err();
        assert!(matches!(err, RuntimeError::StillInUse { references: 1 }));
        assert!(dir.exists());

        drop(other);
        assert!(!dir.exists());
    }
}

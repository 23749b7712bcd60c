//! Loaded modules and their calls.
//!
//! This module provides [`ModuleHandle`], a compiled module bound to its
//! entry point, ABI dialect and log callback. Each [`ModuleHandle::run`]
//! builds a fresh sandbox, so handles can be shared across tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use sandcall_common::{EntryPointShape, MountSpec, RuntimeConfig, RuntimeError};
use sandcall_core::store::{StoreOptions, create_store};
use sandcall_core::{
    AbiDialect, CallSpec, CompiledModule, InstanceRunner, LogCallback, RunOutput, SystemInterface,
};
use sandcall_host::build_runner;

use crate::runtime::Runtime;

/// How to load a module.
#[derive(Clone)]
pub struct LoadOptions {
    /// Name of the exported entry point.
    pub entry_point: String,

    /// Argument shape of the entry point.
    pub entry_shape: EntryPointShape,

    /// Sink receiving every line the guest logs.
    pub log_callback: Option<LogCallback>,
}

impl LoadOptions {
    /// Options for the given entry point with the default shape and no
    /// callback.
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            entry_shape: EntryPointShape::default(),
            log_callback: None,
        }
    }

    /// Set the entry point shape.
    #[must_use]
    pub fn with_shape(mut self, shape: EntryPointShape) -> Self {
        self.entry_shape = shape;
        self
    }

    /// Set the log callback.
    #[must_use]
    pub fn with_log_callback(mut self, callback: LogCallback) -> Self {
        self.log_callback = Some(callback);
        self
    }
}

impl std::fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOptions")
            .field("entry_point", &self.entry_point)
            .field("entry_shape", &self.entry_shape)
            .field("has_log_callback", &self.log_callback.is_some())
            .finish()
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Host directories visible to the guest.
    pub mounts: Vec<MountSpec>,

    /// Environment variables visible to the guest.
    pub env: Vec<(String, String)>,

    /// Time limit for the call. Falls back to the runtime's `timeout_ms`.
    pub deadline: Option<Duration>,

    /// Token that aborts the call when cancelled.
    pub cancel: Option<CancellationToken>,

    /// Identifier passed to entry points with the `with-identifier` shape.
    pub call_id: u64,
}

impl RunOptions {
    /// Add a mount.
    #[must_use]
    pub fn mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the deadline.
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Set the call identifier.
    #[must_use]
    pub fn call_id(mut self, call_id: u64) -> Self {
        self.call_id = call_id;
        self
    }
}

/// A loaded module.
///
/// Cloning is cheap. Every clone keeps the owning [`Runtime`] alive.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    runtime: Runtime,
    module: CompiledModule,
    runner: InstanceRunner,
    dialect: AbiDialect,
    entry_point: String,
    entry_shape: EntryPointShape,
    log_callback: Option<LogCallback>,
    owns_runtime: bool,
}

impl ModuleHandle {
    /// Open a dedicated runtime and load one module into it.
    ///
    /// [`ModuleHandle::close`] on the returned handle also closes the
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be opened or the module cannot
    /// be loaded. A runtime opened here is closed again on failure.
    pub async fn open(
        config: &RuntimeConfig,
        bytecode: &[u8],
        options: LoadOptions,
    ) -> Result<Self, RuntimeError> {
        let runtime = Runtime::open(config)?;

        let engine = runtime.engine().inner().clone();
        let bytecode = bytecode.to_vec();
        let compiled = runtime
            .compile_blocking(move || CompiledModule::from_bytes(&engine, &bytecode))
            .await;
        let module = match compiled {
            Ok(module) => module,
            Err(e) => {
                if let Err(cleanup) = runtime.close() {
                    warn!(error = %cleanup, "Failed to close runtime after load error");
                }
                return Err(e);
            }
        };

        // On failure the clone moved into `prepare` is gone, so `runtime` is
        // the last reference again.
        match Self::prepare(runtime.clone(), module, options, true).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(cleanup) = runtime.close() {
                    warn!(error = %cleanup, "Failed to close runtime after load error");
                }
                Err(e)
            }
        }
    }

    /// Link host functions and detect the ABI dialect of a compiled module.
    pub(crate) async fn prepare(
        runtime: Runtime,
        module: CompiledModule,
        options: LoadOptions,
        owns_runtime: bool,
    ) -> Result<Self, RuntimeError> {
        let runner = build_runner(runtime.engine(), &module)?;

        let probe_options = StoreOptions {
            invocation_id: format!("probe-{}", Uuid::new_v4()),
            ..Default::default()
        };
        let mut store = create_store(runtime.engine(), runtime.exec_config(), probe_options)?;
        let probe = runner.probe_dialect(&module, &mut store);
        let dialect = with_deadline(probe, runtime.exec_config().timeout()).await?;
        drop(store);

        info!(
            content_hash = %module.content_hash(),
            entry_point = %options.entry_point,
            dialect = %dialect,
            system_interface = %module.system_interface(),
            "Module loaded"
        );

        Ok(Self {
            inner: Arc::new(HandleInner {
                runtime,
                module,
                runner,
                dialect,
                entry_point: options.entry_point,
                entry_shape: options.entry_shape,
                log_callback: options.log_callback,
                owns_runtime,
            }),
        })
    }

    /// Run one request through a fresh instance of the module.
    ///
    /// The call is abandoned, and its sandbox torn down, when the deadline
    /// passes or the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A mount cannot be opened
    /// - The guest traps, runs out of fuel or breaks the call protocol
    /// - The deadline passes ([`RuntimeError::DeadlineExceeded`])
    /// - The token is cancelled ([`RuntimeError::Cancelled`])
    #[instrument(skip(self, request, options), fields(entry_point = %self.inner.entry_point))]
    pub async fn run(&self, request: &str, options: RunOptions) -> Result<RunOutput, RuntimeError> {
        let inner = &*self.inner;
        let exec_config = inner.runtime.exec_config();
        let invocation_id = Uuid::new_v4().to_string();

        let store_options = StoreOptions {
            invocation_id: invocation_id.clone(),
            mounts: options.mounts,
            env: options.env,
            log_callback: inner.log_callback.clone(),
        };
        let mut store = create_store(inner.runtime.engine(), exec_config, store_options)?;

        let call = CallSpec {
            entry_point: inner.entry_point.clone(),
            shape: inner.entry_shape,
            dialect: inner.dialect,
            call_id: options.call_id,
        };

        let deadline = options.deadline.or_else(|| exec_config.timeout());
        let cancel = options.cancel.unwrap_or_default();
        let start = Instant::now();

        debug!(invocation_id = %invocation_id, ?deadline, "Starting call");

        let invocation = inner.runner.invoke(&inner.module, &mut store, request, &call);
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RuntimeError::Cancelled),
            result = with_deadline(invocation, deadline) => result,
        };

        match &result {
            Err(e) if e.is_cancellation() => {
                warn!(
                    invocation_id = %invocation_id,
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Call abandoned"
                );
            }
            _ => {}
        }

        result
    }

    /// Release the handle.
    ///
    /// A handle from [`ModuleHandle::open`] also closes its runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StillInUse`] if clones of an owning handle are
    /// alive, or any error from closing the runtime.
    pub fn close(self) -> Result<(), RuntimeError> {
        if !self.inner.owns_runtime {
            return Ok(());
        }

        let inner = Arc::try_unwrap(self.inner).map_err(|inner| RuntimeError::StillInUse {
            references: Arc::strong_count(&inner) - 1,
        })?;

        inner.runtime.close()
    }

    /// Calling dialect detected at load.
    pub fn dialect(&self) -> AbiDialect {
        self.inner.dialect
    }

    /// System interface the module imports.
    pub fn system_interface(&self) -> SystemInterface {
        self.inner.module.system_interface()
    }

    /// Name of the entry point.
    pub fn entry_point(&self) -> &str {
        &self.inner.entry_point
    }

    /// The compiled module.
    pub fn module(&self) -> &CompiledModule {
        &self.inner.module
    }

    /// The runtime this module was loaded into.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("module", &self.inner.module)
            .field("entry_point", &self.inner.entry_point)
            .field("entry_shape", &self.inner.entry_shape)
            .field("dialect", &self.inner.dialect)
            .field("owns_runtime", &self.inner.owns_runtime)
            .finish_non_exhaustive()
    }
}

/// Await `call`, giving up once `deadline` has passed.
async fn with_deadline<T, F>(call: F, deadline: Option<Duration>) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    let Some(deadline) = deadline else {
        return call.await;
    };

    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or_else(|_| {
            Err(RuntimeError::DeadlineExceeded {
                duration_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            })
        })
}

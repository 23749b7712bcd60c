//! Error types for sandcall.
//!
//! [`RuntimeError`] covers the whole lifecycle of a guest module, grouped the
//! same way callers tend to branch on them:
//! - setup (cache directory, compilation)
//! - instantiation (exports, imports, mounts)
//! - guest execution (traps, fuel, deadlines, cancellation)
//! - the host/guest memory protocol
//! - cleanup

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The compilation cache was configured with an empty directory.
    #[error("Compilation cache directory must not be empty")]
    EmptyCacheDirectory,

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The guest module does not export a function the calling convention needs.
    #[error("Missing export: {name}")]
    MissingExport {
        /// Name of the missing export.
        name: String,
    },

    /// Linking or instantiating the guest module failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// A mount specification could not be parsed or applied.
    #[error("Invalid mount '{spec}': {reason}")]
    InvalidMount {
        /// The mount specification as given.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The guest trapped or otherwise failed while running.
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        /// Description of the failure, usually the trap message.
        message: String,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The call did not finish before its deadline.
    #[error("Execution deadline exceeded after {duration_ms}ms")]
    DeadlineExceeded {
        /// The deadline in milliseconds.
        duration_ms: u64,
    },

    /// The caller cancelled the call.
    #[error("Execution cancelled")]
    Cancelled,

    /// A read or write touched guest memory outside its current bounds.
    #[error(
        "Memory access out of range: offset {offset}, length {length}, memory size {memory_size}"
    )]
    MemoryAccess {
        /// Offset of the access.
        offset: u64,
        /// Length of the access in bytes.
        length: u64,
        /// Current size of the guest's linear memory in bytes.
        memory_size: u64,
    },

    /// The result envelope written by the guest could not be decoded.
    #[error("Result envelope decode failed: expected {expected} bytes, got {actual}")]
    EnvelopeDecode {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The guest allocator returned a null pointer.
    #[error("Guest allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested size in bytes.
        size: u64,
    },

    /// One or more cleanup steps failed.
    #[error("Cleanup failed: {}", failures.join("; "))]
    Cleanup {
        /// Every failure encountered, in the order they occurred.
        failures: Vec<String>,
    },

    /// A runtime cannot be closed while module handles still reference it.
    #[error("Runtime still in use by {references} handle(s)")]
    StillInUse {
        /// Number of outstanding references.
        references: usize,
    },
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>) -> Self {
        Self::MissingExport { name: name.into() }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `ExecutionFailed` error.
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Create a new `InvalidMount` error.
    pub fn invalid_mount(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMount {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Join several errors into a single `Cleanup` error.
    ///
    /// Returns `None` when there is nothing to report.
    pub fn join(errors: impl IntoIterator<Item = RuntimeError>) -> Option<Self> {
        let failures: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
        if failures.is_empty() {
            None
        } else {
            Some(Self::Cleanup { failures })
        }
    }

    /// Returns `true` if the caller gave up, as opposed to the guest or
    /// engine failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded { .. })
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::DeadlineExceeded { .. })
    }

    /// Returns `true` for errors raised while loading a module.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::EmptyCacheDirectory
                | Self::CompilationFailed { .. }
                | Self::InvalidConfig { .. }
                | Self::Io(_)
        )
    }
}

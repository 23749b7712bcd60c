//! The host/guest calling convention.
//!
//! Every exchange with a guest goes through its own allocator: the host asks
//! the guest's `malloc` for space, writes into it, and hands it back through
//! `free` when done. The guest answers with a [`ResultEnvelope`] whose second
//! word packs a pointer and a length (see [`pack`]).
//!
//! # Memory Protocol
//!
//! ```text
//! result envelope (16 bytes, little-endian)
//! ┌──────────────────────┬──────────────────────────────────────┐
//! │ errno: u64           │ encoded_result: u64                  │
//! └──────────────────────┴──────────────────────────────────────┘
//!                          high 32 bits: offset │ low 32 bits: length
//! ```
//!
//! Guest allocations are tracked on a [`ReleaseStack`] instead of through
//! destructors, since freeing one is itself an async call into the guest.

use tracing::{debug, warn};
use wasmtime::{AsContext, AsContextMut, Func, Instance, Memory, Val, ValType};

use sandcall_common::RuntimeError;

/// Size of the result envelope in bytes.
pub const ENVELOPE_SIZE: usize = 16;

/// Pack a guest offset and length into one word, offset in the high half.
pub const fn pack(offset: u32, length: u32) -> u64 {
    ((offset as u64) << 32) | length as u64
}

/// Split a packed word into `(offset, length)`.
#[allow(clippy::cast_possible_truncation)]
pub const fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// A span of guest linear memory handed out by the guest's allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Offset into linear memory.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
}

impl MemoryRegion {
    /// Create a region.
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }
}

/// The record a guest writes to report the outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultEnvelope {
    /// Guest-defined status code; `0` conventionally means success.
    pub errno: u64,
    /// Packed offset and length of the response text.
    pub encoded_result: u64,
}

impl ResultEnvelope {
    /// Decode an envelope from the bytes read at the result region.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::EnvelopeDecode`] when fewer than
    /// [`ENVELOPE_SIZE`] bytes are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, RuntimeError> {
        let Some((errno, rest)) = bytes.split_first_chunk::<8>() else {
            return Err(Self::short(bytes));
        };
        let Some((encoded, _)) = rest.split_first_chunk::<8>() else {
            return Err(Self::short(bytes));
        };

        Ok(Self {
            errno: u64::from_le_bytes(*errno),
            encoded_result: u64::from_le_bytes(*encoded),
        })
    }

    fn short(bytes: &[u8]) -> RuntimeError {
        RuntimeError::EnvelopeDecode {
            expected: ENVELOPE_SIZE,
            actual: bytes.len(),
        }
    }

    /// The guest-allocated region holding the response, if any.
    ///
    /// A zero offset means the guest returned no response.
    pub fn response_region(&self) -> Option<MemoryRegion> {
        let (offset, length) = unpack(self.encoded_result);
        (offset != 0).then_some(MemoryRegion::new(offset, length))
    }
}

/// How a guest's `free` export expects to be called.
///
/// Fixed once per module by probing its `ver` export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AbiDialect {
    /// `free(ptr)`
    #[default]
    Default,
    /// `free(ptr, size)`
    AlternateFree,
}

impl AbiDialect {
    /// Map the value returned by a guest's `ver` export to a dialect.
    pub const fn from_version(version: u64) -> Self {
        match version {
            0 => Self::Default,
            _ => Self::AlternateFree,
        }
    }

    /// Arguments to pass to `free` when releasing `region`.
    pub fn free_args(self, region: MemoryRegion) -> Vec<u64> {
        match self {
            Self::Default => vec![u64::from(region.offset)],
            Self::AlternateFree => vec![u64::from(region.offset), u64::from(region.size)],
        }
    }
}

impl std::fmt::Display for AbiDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbiDialect::Default => write!(f, "default"),
            AbiDialect::AlternateFree => write!(f, "alternate-free"),
        }
    }
}

/// An exported guest function called with integer arguments.
///
/// Arguments and results travel as `u64` and are narrowed or widened to the
/// function's declared `i32`/`i64` types, so guests built for 32-bit and
/// 64-bit pointer widths share one call path.
#[derive(Debug, Clone)]
pub struct GuestFunc {
    name: String,
    func: Func,
    params: Vec<ValType>,
    results: Vec<ValType>,
}

impl GuestFunc {
    /// Look up an exported function.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingExport`] if there is no function export
    /// with that name.
    pub fn resolve(
        mut store: impl AsContextMut,
        instance: &Instance,
        name: &str,
    ) -> Result<Self, RuntimeError> {
        let func = instance
            .get_func(&mut store, name)
            .ok_or_else(|| RuntimeError::missing_export(name))?;
        let ty = func.ty(&store);

        Ok(Self {
            name: name.to_string(),
            func,
            params: ty.params().collect(),
            results: ty.results().collect(),
        })
    }

    /// Export name of this function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parameters the function declares.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Call the function.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the arguments do not fit the signature or
    /// the guest traps.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub async fn call<T: Send>(
        &self,
        mut store: impl AsContextMut<Data = T>,
        args: &[u64],
    ) -> wasmtime::Result<Vec<u64>> {
        if args.len() != self.params.len() {
            anyhow::bail!(
                "`{}` takes {} argument(s), {} given",
                self.name,
                self.params.len(),
                args.len()
            );
        }

        let params = self
            .params
            .iter()
            .zip(args)
            .map(|(ty, &arg)| match ty {
                ValType::I32 => Ok(Val::I32(arg as u32 as i32)),
                ValType::I64 => Ok(Val::I64(arg as i64)),
                other => Err(anyhow::anyhow!(
                    "`{}` has unsupported parameter type {other:?}",
                    self.name
                )),
            })
            .collect::<wasmtime::Result<Vec<_>>>()?;

        let mut results = vec![Val::I32(0); self.results.len()];
        self.func
            .call_async(&mut store, &params, &mut results)
            .await?;

        results
            .into_iter()
            .map(|val| match val {
                Val::I32(v) => Ok(u64::from(v as u32)),
                Val::I64(v) => Ok(v as u64),
                other => Err(anyhow::anyhow!(
                    "`{}` returned unsupported value {other:?}",
                    self.name
                )),
            })
            .collect()
    }
}

/// Bounds-checked access to a guest's exported linear memory.
#[derive(Debug, Clone, Copy)]
pub struct GuestMemory {
    memory: Memory,
}

impl GuestMemory {
    /// Look up the guest's `memory` export.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingExport`] if the guest exports no memory.
    pub fn resolve(store: impl AsContextMut, instance: &Instance) -> Result<Self, RuntimeError> {
        instance
            .get_memory(store, "memory")
            .map(|memory| Self { memory })
            .ok_or_else(|| RuntimeError::missing_export("memory"))
    }

    /// Current size of linear memory in bytes.
    pub fn size(&self, store: impl AsContext) -> u64 {
        self.memory.data_size(store) as u64
    }

    /// Read exactly `region.size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MemoryAccess`] naming the span and the current
    /// memory size if the span does not fit.
    pub fn read(
        &self,
        store: impl AsContext,
        region: MemoryRegion,
    ) -> Result<Vec<u8>, RuntimeError> {
        let data = self.memory.data(&store);
        let start = region.offset as usize;
        let end = start + region.size as usize;

        data.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(RuntimeError::MemoryAccess {
                offset: u64::from(region.offset),
                length: u64::from(region.size),
                memory_size: data.len() as u64,
            })
    }

    /// Read up to `region.size` bytes, stopping early at the end of memory.
    pub fn read_available(&self, store: impl AsContext, region: MemoryRegion) -> Vec<u8> {
        let data = self.memory.data(&store);
        let start = (region.offset as usize).min(data.len());
        let end = (start + region.size as usize).min(data.len());
        data[start..end].to_vec()
    }

    /// Write `bytes` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MemoryAccess`] if the write does not fit.
    pub fn write(
        &self,
        mut store: impl AsContextMut,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), RuntimeError> {
        let memory_size = self.size(&store);
        self.memory
            .write(&mut store, offset as usize, bytes)
            .map_err(|_| RuntimeError::MemoryAccess {
                offset: u64::from(offset),
                length: bytes.len() as u64,
                memory_size,
            })
    }
}

/// Guest allocations still owed a call to `free`.
///
/// Regions are released in reverse order of acquisition. [`Self::unwind`]
/// drains the stack, so each region is released at most once.
#[derive(Debug, Default)]
pub struct ReleaseStack {
    regions: Vec<MemoryRegion>,
}

impl ReleaseStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a region that must be freed.
    pub fn push(&mut self, region: MemoryRegion) {
        self.regions.push(region);
    }

    /// Number of regions awaiting release.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Check whether nothing awaits release.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Free every recorded region through the guest's `free` export.
    ///
    /// Failures are logged and counted; they never stop the remaining
    /// releases. Returns the number of failed releases.
    pub async fn unwind<T: Send>(
        &mut self,
        mut store: impl AsContextMut<Data = T>,
        free: &GuestFunc,
        dialect: AbiDialect,
    ) -> usize {
        let mut failures = 0;

        while let Some(region) = self.regions.pop() {
            match free.call(&mut store, &dialect.free_args(region)).await {
                Ok(_) => {
                    debug!(offset = region.offset, size = region.size, "Released guest region");
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        offset = region.offset,
                        size = region.size,
                        error = %e,
                        "Failed to release guest region"
                    );
                }
            }
        }

        failures
    }
}

use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use libloading::os::unix::Library;
use sha2::{Digest, Sha256};

use crate::config::{ResolvedRuntimeConfig, RuntimeConfig};
use crate::error::MlaError;
use crate::ffi::{
    HostTensorShape, MlaLastErrorFn, MlaStage1Args, MlaStage1Fn, c_str_to_string, dl_dtype,
    dl_dtype_i32,
};
use crate::stage1::{Stage1Inputs, Stage1Kernel, Stage1Mode};
use crate::tensor::Element;

const DECODE_SYMBOL: &[u8] = b"mla_decode_stage1_fwd\0";
const DECODE_SYMBOL_NAME: &str = "mla_decode_stage1_fwd";
const PREFILL_SYMBOL: &[u8] = b"mla_prefill_fwd\0";
const LAST_ERROR_SYMBOL: &[u8] = b"mla_last_error\0";

/// Stage-1 kernel provided by a vendor shared library.
pub struct KernelRuntime {
    resolved: ResolvedRuntimeConfig,
    library_path: PathBuf,
    _lib: Library,
    decode: MlaStage1Fn,
    prefill: Option<MlaStage1Fn>,
    last_error: Option<MlaLastErrorFn>,
}

static GLOBAL_RUNTIME: OnceLock<KernelRuntime> = OnceLock::new();
static RUNTIME_INIT_LOCK: Mutex<()> = Mutex::new(());

impl std::fmt::Debug for KernelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRuntime")
            .field("library_path", &self.library_path)
            .field("has_prefill", &self.prefill.is_some())
            .finish()
    }
}

impl KernelRuntime {
    pub fn initialize(config: RuntimeConfig) -> Result<&'static Self, MlaError> {
        let resolved = config.resolve()?;

        let _init_guard = RUNTIME_INIT_LOCK
            .lock()
            .map_err(|_| MlaError::invalid_argument("runtime lock is poisoned"))?;

        if let Some(runtime) = GLOBAL_RUNTIME.get() {
            if runtime.resolved == resolved {
                return Ok(runtime);
            }
            return Err(MlaError::RuntimeAlreadyInitialized);
        }

        // SAFETY: symbol resolution is validated in `load`; the library stays
        // loaded for the life of the process.
        let runtime = unsafe { Self::load(resolved)? };
        let _ = GLOBAL_RUNTIME.set(runtime);
        GLOBAL_RUNTIME
            .get()
            .ok_or_else(|| MlaError::invalid_argument("failed to initialize runtime"))
    }

    pub fn global() -> Result<&'static Self, MlaError> {
        Self::initialize(RuntimeConfig::default())
    }

    /// Loads a kernel library without registering it globally.
    ///
    /// # Safety
    /// The library's exported symbols must follow the ABI in [`crate::ffi`];
    /// its initialisers run on load.
    pub unsafe fn open(config: RuntimeConfig) -> Result<Self, MlaError> {
        let resolved = config.resolve()?;
        // SAFETY: forwarded caller contract.
        unsafe { Self::load(resolved) }
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }

    pub fn supports_prefill(&self) -> bool {
        self.prefill.is_some()
    }

    unsafe fn load(resolved: ResolvedRuntimeConfig) -> Result<Self, MlaError> {
        let Some(library_path) = resolved.stage1_library.clone() else {
            return Err(MlaError::KernelNotConfigured);
        };

        match resolved.stage1_sha256.as_deref() {
            Some(expected) => verify_sha256(&library_path, expected)?,
            None => tracing::warn!(
                library = %library_path.display(),
                "loading stage-1 kernel without a pinned checksum"
            ),
        }

        let lib = unsafe { Library::open(Some(&library_path), libc::RTLD_NOW | libc::RTLD_LOCAL) }
            .map_err(|e| MlaError::LibraryLoad {
                library: library_path.clone(),
                message: e.to_string(),
            })?;

        let decode: MlaStage1Fn =
            unsafe { resolve_symbol(&lib, &library_path, DECODE_SYMBOL, DECODE_SYMBOL_NAME)? };
        let prefill: Option<MlaStage1Fn> = unsafe { optional_symbol(&lib, PREFILL_SYMBOL) };
        let last_error: Option<MlaLastErrorFn> = unsafe { optional_symbol(&lib, LAST_ERROR_SYMBOL) };

        tracing::info!(
            library = %library_path.display(),
            prefill = prefill.is_some(),
            "loaded stage-1 kernel library"
        );

        Ok(Self {
            resolved,
            library_path,
            _lib: lib,
            decode,
            prefill,
            last_error,
        })
    }

    fn decode_error(&self, code: i32) -> MlaError {
        let message = match self.last_error {
            // SAFETY: symbol follows the `mla_last_error` ABI.
            Some(last_error) => unsafe { c_str_to_string(last_error()) },
            None => String::new(),
        };
        MlaError::kernel_call(code, message)
    }
}

impl Stage1Kernel for KernelRuntime {
    fn name(&self) -> &str {
        "shared-library"
    }

    fn forward<T: Element, O: Element>(
        &self,
        inputs: &Stage1Inputs<'_, T>,
        partial_out: &mut [O],
        partial_lse: &mut [f32],
    ) -> Result<(), MlaError> {
        inputs.validate(partial_out.len(), partial_lse.len())?;

        let run = match inputs.mode {
            Stage1Mode::Decode => self.decode,
            Stage1Mode::Prefill => self.prefill.ok_or_else(|| {
                MlaError::invalid_argument(format!(
                    "`{}` does not export mla_prefill_fwd",
                    self.library_path.display()
                ))
            })?,
        };

        let layout = inputs.layout;
        let batch = layout.batch_size;
        let mut q_shape = HostTensorShape::contiguous(inputs.q.dims());
        let mut kv_shape = HostTensorShape::contiguous(inputs.kv_buffer.dims());
        let mut qo_indptr_shape = HostTensorShape::contiguous([batch + 1]);
        let mut kv_indptr_shape = HostTensorShape::contiguous([batch + 1]);
        let mut kv_indices_shape = HostTensorShape::contiguous([inputs.kv_indices.len()]);
        let mut last_page_shape = HostTensorShape::contiguous([batch]);
        let mut out_shape = HostTensorShape::contiguous([
            layout.total_query_tokens,
            inputs.num_kv_splits,
            layout.num_heads,
            layout.value_head_dim,
        ]);
        let mut lse_shape = HostTensorShape::contiguous([
            layout.total_query_tokens,
            inputs.num_kv_splits,
            layout.num_heads,
            1,
        ]);

        let args = MlaStage1Args {
            q: q_shape.describe(inputs.q.data.as_ptr().cast(), dl_dtype(T::DTYPE)),
            kv_buffer: kv_shape
                .describe(inputs.kv_buffer.data.as_ptr().cast(), dl_dtype(T::DTYPE)),
            qo_indptr: qo_indptr_shape.describe(inputs.qo_indptr.as_ptr().cast(), dl_dtype_i32()),
            kv_indptr: kv_indptr_shape.describe(inputs.kv_indptr.as_ptr().cast(), dl_dtype_i32()),
            kv_indices: kv_indices_shape
                .describe(inputs.kv_indices.as_ptr().cast(), dl_dtype_i32()),
            kv_last_page_lens: last_page_shape
                .describe(inputs.kv_last_page_lens.as_ptr().cast(), dl_dtype_i32()),
            partial_out: out_shape.describe(
                partial_out.as_mut_ptr().cast::<c_void>().cast_const(),
                dl_dtype(O::DTYPE),
            ),
            partial_lse: lse_shape.describe(
                partial_lse.as_mut_ptr().cast::<c_void>().cast_const(),
                dl_dtype(crate::tensor::DType::F32),
            ),
            max_seqlen_q: to_i32("max_seqlen_q", inputs.max_seqlen_q)?,
            num_kv_splits: to_i32("num_kv_splits", inputs.num_kv_splits)?,
            min_chunk_size: to_i32("min_chunk_size", inputs.min_chunk_size)?,
            sm_scale: inputs.sm_scale,
        };

        // SAFETY: every descriptor points at a live, correctly sized host
        // buffer (checked by `Stage1Inputs::validate`), and
        // the shape arrays outlive the call.
        let code = unsafe { run(&args as *const MlaStage1Args) };
        if code == 0 {
            return Ok(());
        }
        Err(self.decode_error(code))
    }
}

unsafe fn resolve_symbol<T: Copy>(
    lib: &Library,
    library: &Path,
    symbol_bytes: &'static [u8],
    symbol_name: &'static str,
) -> Result<T, MlaError> {
    // SAFETY: caller provides the concrete symbol type and this function only copies fn ptr values.
    let symbol = unsafe { lib.get::<T>(symbol_bytes) }.map_err(|e| MlaError::SymbolResolve {
        library: library.to_path_buf(),
        symbol: symbol_name,
        message: e.to_string(),
    })?;
    Ok(*symbol)
}

unsafe fn optional_symbol<T: Copy>(lib: &Library, symbol_bytes: &'static [u8]) -> Option<T> {
    // SAFETY: see `resolve_symbol`.
    unsafe { lib.get::<T>(symbol_bytes) }.ok().map(|s| *s)
}

fn to_i32(name: &str, value: usize) -> Result<i32, MlaError> {
    i32::try_from(value)
        .map_err(|_| MlaError::invalid_argument(format!("{name} ({value}) does not fit in i32")))
}

fn verify_sha256(path: &Path, expected: &str) -> Result<(), MlaError> {
    let found = sha256_file_hex(path)?;
    if found != expected {
        return Err(MlaError::KernelChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            found,
        });
    }
    Ok(())
}

fn sha256_file_hex(path: &Path) -> Result<String, MlaError> {
    let mut file = File::open(path).map_err(|e| MlaError::KernelIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| MlaError::KernelIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

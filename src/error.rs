use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MlaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch for `{name}`: expected {expected}, found {found}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        found: String,
    },

    #[error("num_heads={num_heads} has no min-chunk-size policy (supported: 16, 128)")]
    UnsupportedHeadCount { num_heads: usize },

    #[error("logit_cap={logit_cap} is not supported; only logit_cap <= 0 is accepted")]
    UnsupportedLogitCap { logit_cap: f32 },

    #[error("invalid environment variable `{name}`: {message}")]
    InvalidEnvironment { name: &'static str, message: String },

    #[error("failed to read stage-1 kernel library `{path}`")]
    KernelIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "stage-1 kernel library checksum mismatch for `{path}`: expected {expected}, found {found}"
    )]
    KernelChecksumMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("failed to load shared library `{library}`: {message}")]
    LibraryLoad { library: PathBuf, message: String },

    #[error("failed to resolve symbol `{symbol}` from `{library}`: {message}")]
    SymbolResolve {
        library: PathBuf,
        symbol: &'static str,
        message: String,
    },

    #[error("stage-1 kernel call failed (code {code}){message_suffix}")]
    KernelCall { code: i32, message_suffix: String },

    #[error("no stage-1 kernel library configured; set MLA_RS_STAGE1_LIBRARY")]
    KernelNotConfigured,

    #[error("runtime has already been initialized with a different configuration")]
    RuntimeAlreadyInitialized,
}

impl MlaError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn shape_mismatch(
        name: &'static str,
        expected: impl std::fmt::Debug,
        found: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            name,
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
    }

    pub(crate) fn kernel_call(code: i32, message: String) -> Self {
        let message_suffix = if message.is_empty() {
            String::new()
        } else {
            format!(": {message}")
        };
        Self::KernelCall {
            code,
            message_suffix,
        }
    }
}

use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use crate::error::MlaError;

const ENV_STAGE1_LIBRARY: &str = "MLA_RS_STAGE1_LIBRARY";
const ENV_STAGE1_SHA256: &str = "MLA_RS_STAGE1_SHA256";
const ENV_COMPUTE_UNITS: &str = "MLA_RS_COMPUTE_UNITS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedRuntimeConfig {
    pub(crate) stage1_library: Option<PathBuf>,
    pub(crate) stage1_sha256: Option<String>,
    pub(crate) compute_units: usize,
}

/// Process-level settings. Explicit values take precedence over the
/// `MLA_RS_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Shared library exporting the stage-1 kernel.
    pub stage1_library: Option<PathBuf>,
    /// Expected lowercase hex SHA-256 of `stage1_library`.
    pub stage1_sha256: Option<String>,
    /// Parallel compute units the split heuristic balances against.
    pub compute_units: Option<usize>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, MlaError> {
        Ok(Self {
            stage1_library: env_string(ENV_STAGE1_LIBRARY)?.map(PathBuf::from),
            stage1_sha256: env_string(ENV_STAGE1_SHA256)?,
            compute_units: env_usize(ENV_COMPUTE_UNITS)?,
        })
    }

    pub fn with_stage1_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.stage1_library = Some(path.into());
        self
    }

    pub fn with_stage1_sha256(mut self, sha256_hex: impl Into<String>) -> Self {
        self.stage1_sha256 = Some(sha256_hex.into());
        self
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = Some(compute_units);
        self
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedRuntimeConfig, MlaError> {
        let env_cfg = RuntimeConfig::from_env()?;

        let compute_units = match self.compute_units.or(env_cfg.compute_units) {
            Some(0) => {
                return Err(MlaError::invalid_argument("compute_units must be positive"));
            }
            Some(n) => n,
            None => default_compute_units(),
        };
        let stage1_sha256 = self
            .stage1_sha256
            .clone()
            .or(env_cfg.stage1_sha256)
            .map(|sha| sha.to_ascii_lowercase());

        Ok(ResolvedRuntimeConfig {
            stage1_library: self.stage1_library.clone().or(env_cfg.stage1_library),
            stage1_sha256,
            compute_units,
        })
    }
}

/// Stage-2 launch parameters, kept apart from the reduction itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Accumulator lanes per output row: the next power of two `>= Lv`.
    /// Lanes past `Lv` stay zero and are never stored.
    pub block_dv: usize,
    /// Minimum query rows handed to one worker task.
    pub min_rows_per_task: usize,
}

impl LaunchConfig {
    pub fn for_value_dim(value_head_dim: usize) -> Self {
        Self {
            block_dv: value_head_dim.next_power_of_two(),
            min_rows_per_task: 1,
        }
    }

    pub fn with_min_rows_per_task(mut self, min_rows_per_task: usize) -> Self {
        self.min_rows_per_task = min_rows_per_task;
        self
    }

    pub fn validate(&self, value_head_dim: usize) -> Result<(), MlaError> {
        if !self.block_dv.is_power_of_two() || self.block_dv < value_head_dim {
            return Err(MlaError::invalid_argument(format!(
                "block_dv ({}) must be a power of two >= value head dim ({value_head_dim})",
                self.block_dv
            )));
        }
        if self.min_rows_per_task == 0 {
            return Err(MlaError::invalid_argument(
                "min_rows_per_task must be positive",
            ));
        }
        Ok(())
    }
}

fn default_compute_units() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn env_string(name: &'static str) -> Result<Option<String>, MlaError> {
    let Some(value) = env::var_os(name) else {
        return Ok(None);
    };

    if value.is_empty() {
        return Err(MlaError::InvalidEnvironment {
            name,
            message: "value is empty".to_string(),
        });
    }

    value
        .into_string()
        .map(Some)
        .map_err(|_| MlaError::InvalidEnvironment {
            name,
            message: "value is not valid UTF-8".to_string(),
        })
}

fn env_usize(name: &'static str) -> Result<Option<usize>, MlaError> {
    let Some(value) = env_string(name)? else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|e| MlaError::InvalidEnvironment {
            name,
            message: format!("`{value}` is not a non-negative integer: {e}"),
        })
}

#[cfg(test)]
pub(crate) static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

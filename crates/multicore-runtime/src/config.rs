//! Runtime configuration
//!
//! Everything here has a usable default, so an empty JSON object is a valid
//! config. Capacities left unset are taken from the guest's optional
//! `get_thread_flags_len` / `get_barrier_data_len` exports, falling back to
//! [`DEFAULT_FLAG_CAPACITY`] and [`DEFAULT_BARRIER_CAPACITY`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RuntimeError, RuntimeResult};

/// Completion flag cells assumed when neither config nor guest says otherwise
pub const DEFAULT_FLAG_CAPACITY: u32 = 32;

/// Barrier quads assumed when neither config nor guest says otherwise
pub const DEFAULT_BARRIER_CAPACITY: u32 = 4;

/// Hosts reporting fewer logical cores than this get [`LOW_CORE_FALLBACK`]
const LOW_CORE_THRESHOLD: usize = 8;
const LOW_CORE_FALLBACK: usize = 16;

/// Extra pool slots on top of the reported core count
const POOL_HEADROOM: usize = 4;

/// Page limits of the shared memory, in 64 KiB pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub minimum: u32,
    pub maximum: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of pool execution contexts. Defaults to `core_count + 4`,
    /// clamped to the flag capacity.
    pub pool_size: Option<usize>,

    /// Parallelism reported to the guest through `__core_count`
    pub core_count: usize,

    pub flag_capacity: Option<u32>,
    pub barrier_capacity: Option<u32>,

    /// Override the limits declared by the guest's `env.memory` import
    pub memory_pages: Option<MemoryLimits>,

    /// Export run on the main context by [`crate::MulticoreRuntime::run_main`]
    pub main_entry: String,

    /// Whether to log every spawn, join and barrier release
    pub enable_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            core_count: default_core_count(),
            flag_capacity: None,
            barrier_capacity: None,
            memory_pages: None,
            main_entry: "wasm_main".to_string(),
            enable_logging: false,
        }
    }
}

/// Logical core count reported to guests.
///
/// Small machines (and sandboxes that hide their cores) report a higher
/// figure so that guests sizing their thread count from it still get
/// meaningful parallelism.
pub fn default_core_count() -> usize {
    let cores = num_cpus::get();
    if cores < LOW_CORE_THRESHOLD {
        LOW_CORE_FALLBACK
    } else {
        cores
    }
}

impl RuntimeConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: RuntimeConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.pool_size == Some(0) {
            return Err(RuntimeError::Config(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.core_count == 0 {
            return Err(RuntimeError::Config(
                "core_count must be at least 1".to_string(),
            ));
        }
        if self.main_entry.is_empty() {
            return Err(RuntimeError::Config(
                "main_entry must name an export".to_string(),
            ));
        }
        if let Some(limits) = self.memory_pages {
            if limits.minimum > limits.maximum {
                return Err(RuntimeError::Config(format!(
                    "memory minimum {} exceeds maximum {}",
                    limits.minimum, limits.maximum
                )));
            }
        }
        Ok(())
    }

    /// Pool size to preload, given the number of completion flags available.
    ///
    /// Every live thread owns the flag of the slot it runs on, so the pool can
    /// never be larger than the flag array.
    pub fn resolve_pool_size(&self, flag_capacity: u32) -> RuntimeResult<usize> {
        if flag_capacity == 0 {
            return Err(RuntimeError::Config(
                "completion flag capacity is zero".to_string(),
            ));
        }
        let capacity = flag_capacity as usize;
        match self.pool_size {
            Some(size) if size > capacity => Err(RuntimeError::Config(format!(
                "pool_size {} exceeds completion flag capacity {}",
                size, capacity
            ))),
            Some(size) => Ok(size),
            None => {
                let wanted = self.core_count + POOL_HEADROOM;
                if wanted > capacity {
                    log::warn!(
                        "Clamping pool size {} to completion flag capacity {}",
                        wanted,
                        capacity
                    );
                }
                Ok(wanted.min(capacity))
            }
        }
    }
}

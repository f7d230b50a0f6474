//! Test suite for the multicore runtime
//!
//! Guests are written to a temporary directory and loaded through
//! `GuestModule::from_file`, the same path the `multicore-run` binary takes.

use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

use multicore_runtime::test_utils::GUEST_WAT;
use multicore_runtime::{GuestModule, MulticoreRuntime, RuntimeConfig};

pub mod end_to_end_test;

/// A guest fixture on disk plus the config to preload it with
pub struct TestConfig {
    // Keeps the directory alive for as long as the paths are in use
    dir: TempDir,
    pub guest_path: PathBuf,
    pub runtime: RuntimeConfig,
}

impl TestConfig {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let guest_path = dir.path().join("guest.wat");
        std::fs::File::create(&guest_path)?.write_all(GUEST_WAT.as_bytes())?;
        Ok(Self {
            dir,
            guest_path,
            runtime: RuntimeConfig {
                pool_size: Some(4),
                core_count: 8,
                enable_logging: true,
                ..Default::default()
            },
        })
    }

    /// Write `contents` next to the guest and return its path
    pub fn write_file(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn load_module(&self) -> Result<GuestModule> {
        GuestModule::from_file(&self.guest_path)
    }

    pub async fn create_runtime(&self) -> Result<MulticoreRuntime> {
        MulticoreRuntime::preload(self.load_module()?, self.runtime.clone()).await
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

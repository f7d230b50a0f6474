//! # multicore-run
//!
//! Loads a guest module, preloads the worker pool and runs the guest's entry
//! point on the main context. The process exits with the value the entry
//! returns (or the code passed to `proc_exit`).
//!
//! ```text
//! RUST_LOG=info multicore-run --module app.wasm --pool-size 8
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use multicore_runtime::{GuestModule, MulticoreRuntime, RuntimeConfig};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    /// Guest module, binary (.wasm) or text (.wat)
    #[arg(long, env = "MULTICORE_MODULE")]
    module: PathBuf,
    #[arg(long, help = "JSON runtime config; flags below override its values")]
    config: Option<PathBuf>,
    #[arg(
        long,
        env = "MULTICORE_POOL_SIZE",
        help = "Number of execution contexts (default: core count + 4)"
    )]
    pool_size: Option<usize>,
    #[arg(long, help = "Parallelism reported to the guest")]
    core_count: Option<usize>,
    #[arg(long, help = "Export to run on the main context")]
    entry: Option<String>,
    #[arg(long, default_value_t = false)]
    verbose_pool: bool,
}

impl Args {
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_json_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(pool_size) = self.pool_size {
            config.pool_size = Some(pool_size);
        }
        if let Some(core_count) = self.core_count {
            config.core_count = core_count;
        }
        if let Some(entry) = &self.entry {
            config.main_entry = entry.clone();
        }
        config.enable_logging |= self.verbose_pool;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder().format_timestamp_secs().init();

    let args = Args::parse();
    let config = args.runtime_config()?;
    info!(
        "Runtime config: {}",
        serde_json::to_string(&config).unwrap_or_default()
    );

    let module = GuestModule::from_file(&args.module)?;
    let mut runtime = MulticoreRuntime::preload(module, config)
        .await
        .context("Failed to preload worker pool")?;
    info!("Worker pool ready: {:?}", runtime.stats()?);

    // The entry blocks on joins and barriers; keep it off the async workers
    let (runtime, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = runtime.run_main();
        (runtime, outcome)
    })
    .await
    .context("Guest entry panicked")?;

    info!("Final pool state: {:?}", runtime.stats()?);
    runtime.shutdown()?;

    match outcome {
        Ok(code) => {
            info!("Guest returned {}", code);
            std::process::exit(code);
        }
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

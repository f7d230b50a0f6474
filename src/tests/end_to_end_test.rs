//! End-to-end tests: guest on disk, preloaded pool, entry point on main

use super::{init_logging, TestConfig};
use anyhow::Result;
use multicore_runtime::test_utils::{COUNTER, SCRATCH};
use multicore_runtime::{MemoryLimits, RuntimeConfig, WASM_PAGE_SIZE};

#[tokio::test]
async fn test_guest_from_disk_runs_barrier_scenario() -> Result<()> {
    init_logging();
    let config = TestConfig::new()?;
    let mut runtime = config.create_runtime().await?;

    assert_eq!(runtime.stats()?.ready, 4);
    assert_eq!(runtime.run_main()?, 4);
    assert_eq!(runtime.arena().load(COUNTER)?, 4);

    // Every worker is back in the pool once main has joined its threads
    let stats = runtime.stats()?;
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.ready, stats.pool_size);

    runtime.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_entry_on_blocking_thread() -> Result<()> {
    init_logging();
    let config = TestConfig::new()?;
    let mut runtime = config.create_runtime().await?;

    let (runtime, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = runtime.run_main();
        (runtime, outcome)
    })
    .await?;

    assert_eq!(outcome?, 4);
    assert_eq!(runtime.stats()?.busy, 0);
    runtime.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_independent_runtimes() -> Result<()> {
    init_logging();
    let config = TestConfig::new()?;
    let mut first = config.create_runtime().await?;
    let mut second = config.create_runtime().await?;

    // Separate arenas: a write to one is invisible to the other
    first.arena().store(SCRATCH, 11)?;
    assert_eq!(second.arena().load(SCRATCH)?, 0);

    let first_run = tokio::task::spawn_blocking(move || {
        let code = first.run_main();
        (first, code)
    });
    let second_run = tokio::task::spawn_blocking(move || {
        let code = second.run_main();
        (second, code)
    });
    let (first, first_code) = first_run.await?;
    let (second, second_code) = second_run.await?;

    assert_eq!(first_code?, 4);
    assert_eq!(second_code?, 4);
    assert_eq!(first.arena().load(SCRATCH)?, 11);
    assert_eq!(second.arena().load(SCRATCH)?, 0);

    first.shutdown()?;
    second.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_config_file_drives_preload() -> Result<()> {
    init_logging();
    let config = TestConfig::new()?;
    let path = config.write_file(
        "runtime.json",
        r#"{"pool_size": 4, "core_count": 3, "memory_pages": {"minimum": 6, "maximum": 32}}"#,
    )?;
    let runtime_config = RuntimeConfig::from_json_file(&path)?;
    assert_eq!(
        runtime_config.memory_pages,
        Some(MemoryLimits {
            minimum: 6,
            maximum: 32
        })
    );

    let module = config.load_module()?;
    let mut runtime = multicore_runtime::MulticoreRuntime::preload(module, runtime_config).await?;

    assert_eq!(runtime.arena().size_bytes(), 6 * WASM_PAGE_SIZE);
    assert_eq!(runtime.call::<(), i32>("guest_core_count", ())?, 3);
    assert_eq!(runtime.run_main()?, 4);

    runtime.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_proc_exit_code_from_disk() -> Result<()> {
    init_logging();
    let mut config = TestConfig::new()?;
    config.runtime.main_entry = "exit_main".to_string();
    let mut runtime = config.create_runtime().await?;

    assert_eq!(runtime.run_main()?, 3);
    runtime.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_missing_guest_file() -> Result<()> {
    let mut config = TestConfig::new()?;
    config.guest_path = config.guest_path.with_file_name("absent.wat");
    let err = config.create_runtime().await.err().expect("load should fail");
    assert!(format!("{:#}", err).contains("absent.wat"));
    Ok(())
}

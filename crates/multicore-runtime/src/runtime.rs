//! Runtime assembly
//!
//! `MulticoreRuntime` ties the pieces together: it allocates the arena,
//! instantiates the main context, negotiates the control-word layout with the
//! guest, preloads the worker pool and finally runs the guest's entry point on
//! the main context.

use anyhow::{Context, Result};
use std::sync::Arc;
use wasmtime::{WasmParams, WasmResults};

use crate::arena::SharedArena;
use crate::config::{RuntimeConfig, DEFAULT_BARRIER_CAPACITY, DEFAULT_FLAG_CAPACITY};
use crate::context::GuestInstance;
use crate::error::{RuntimeError, RuntimeResult};
use crate::host::{HostCalls, ImportProvider};
use crate::layout::{ArenaLayout, ControlWords};
use crate::loader::{
    GuestModule, BARRIERS_LEN, BARRIERS_PTR, FLAGS_LEN, FLAGS_PTR, TLS_REGION_LEN, TLS_REGION_PTR,
};
use crate::pool::PoolStats;
use crate::tls::{TlsAllocator, MAIN_SLOT};

pub struct MulticoreRuntime {
    host: Arc<HostCalls>,
    main: GuestInstance,
    module: GuestModule,
    config: RuntimeConfig,
}

impl MulticoreRuntime {
    /// Build the runtime and wait until every execution context is ready
    pub async fn preload(module: GuestModule, config: RuntimeConfig) -> Result<Self> {
        Self::preload_with_providers(module, config, Vec::new()).await
    }

    pub async fn preload_with_providers(
        module: GuestModule,
        config: RuntimeConfig,
        providers: Vec<Arc<dyn ImportProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        module.expect_entry(&config.main_entry)?;

        let limits = config.memory_pages.unwrap_or_else(|| module.memory_limits());
        let arena = SharedArena::new(module.engine(), limits.minimum, limits.maximum)?;
        let host = Arc::new(HostCalls::new(
            arena.clone(),
            config.core_count,
            config.enable_logging,
        ));

        let mut main = GuestInstance::instantiate(
            &module,
            &arena,
            Arc::downgrade(&host),
            &providers,
            "main".to_string(),
        )
        .context("Failed to instantiate main context")?;

        let layout = Self::negotiate_layout(&mut main, &config)?;
        let control = ControlWords::new(arena.clone(), layout)?;
        let pool_size = config.resolve_pool_size(layout.flag_capacity)?;
        let tls = Self::tls_allocator(&mut main, &module, &arena, &layout, pool_size)?;
        host.install(control, tls)?;

        log::info!(
            "Preloading {} execution contexts (flags at {:#x}, barriers at {:#x}, tls stride {})",
            pool_size,
            layout.flags_base,
            layout.barriers_base,
            tls.stride()
        );
        host.pool()
            .preload(pool_size, &module, &arena, Arc::downgrade(&host), &providers)
            .await?;

        if tls.is_enabled() {
            main.init_tls(tls.slot_base(MAIN_SLOT)?)
                .context("Failed to initialize main context TLS")?;
        }

        Ok(Self {
            host,
            main,
            module,
            config,
        })
    }

    fn negotiate_layout(main: &mut GuestInstance, config: &RuntimeConfig) -> Result<ArenaLayout> {
        let flags_base = main.getter(FLAGS_PTR)?;
        let barriers_base = main.getter(BARRIERS_PTR)?;
        let flag_capacity = match config.flag_capacity {
            Some(capacity) => capacity,
            None => main
                .optional_getter(FLAGS_LEN)?
                .unwrap_or(DEFAULT_FLAG_CAPACITY),
        };
        let barrier_capacity = match config.barrier_capacity {
            Some(capacity) => capacity,
            None => main
                .optional_getter(BARRIERS_LEN)?
                .unwrap_or(DEFAULT_BARRIER_CAPACITY),
        };
        Ok(ArenaLayout {
            flags_base,
            flag_capacity,
            barriers_base,
            barrier_capacity,
        })
    }

    fn tls_allocator(
        main: &mut GuestInstance,
        module: &GuestModule,
        arena: &SharedArena,
        layout: &ArenaLayout,
        pool_size: usize,
    ) -> Result<TlsAllocator> {
        if !module.has_tls() {
            return Ok(TlsAllocator::disabled());
        }
        let (tls_size, tls_align) = main.tls_footprint();
        let region = main.getter(TLS_REGION_PTR)?;
        // Slot 0 is the main context, the pool takes the rest
        let tls = TlsAllocator::new(region, tls_size, tls_align, pool_size as u32 + 1)?;
        if !tls.is_enabled() {
            return Ok(tls);
        }

        let needed = tls.region_end() - region as u64;
        if let Some(reserved) = main.optional_getter(TLS_REGION_LEN)? {
            if needed > reserved as u64 {
                return Err(RuntimeError::TlsRegionTooSmall { needed, reserved }.into());
            }
        }
        if tls.region_end() > arena.size_bytes() {
            return Err(RuntimeError::OutOfBounds {
                offset: region,
                len: tls.stride() * tls.slots(),
            }
            .into());
        }
        layout.check_disjoint("tls region", region as u64, tls.region_end())?;
        Ok(tls)
    }

    /// Run the configured entry point on the main context.
    ///
    /// A guest that calls `proc_exit` returns its exit code.
    pub fn run_main(&mut self) -> Result<i32> {
        let entry = self.config.main_entry.clone();
        match self.main.call::<(), i32>(&entry, ()) {
            Ok(code) => Ok(code),
            Err(e) => match e.downcast_ref::<RuntimeError>() {
                Some(RuntimeError::Exit(code)) => Ok(*code),
                _ => Err(e.context(format!("Guest entry {} failed", entry))),
            },
        }
    }

    /// Call any export on the main context
    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.main.call(name, params)
    }

    pub fn host(&self) -> &Arc<HostCalls> {
        &self.host
    }

    pub fn arena(&self) -> &SharedArena {
        self.host.arena()
    }

    pub fn module(&self) -> &GuestModule {
        &self.module
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> RuntimeResult<PoolStats> {
        self.host.pool().stats()
    }

    /// Stop the pool; idle workers are joined before this returns
    pub fn shutdown(self) -> Result<()> {
        self.host.pool().shutdown()
    }
}

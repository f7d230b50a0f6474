//! Host call surface
//!
//! `HostCalls` is the one object every execution context talks to. It owns
//! the worker pool and the thread registry and holds the control-word views
//! negotiated with the guest during preload. Guest imports are thin wrappers
//! that translate its results into the integer codes the guest expects.
//!
//! # Imports (module `env`)
//!
//! - `__thread_spawn(func, arg, stack_top, tls_base) -> i32`: thread id, or
//!   [`SPAWN_EXHAUSTED`] / [`SPAWN_FAILED`]
//! - `__thread_join(id) -> i32`: `1` completed, `-1` failed, or one of the
//!   negative `JOIN_*` codes
//! - `__thread_cleanup(id)`: release a detached thread that already exited
//! - `__barrier_wait(id)`: traps on an unknown or unconfigured barrier
//! - `__core_count() -> i32`

use anyhow::{anyhow, Result};
use std::sync::{OnceLock, Weak};
use wasmtime::{Caller, Linker};

use crate::arena::SharedArena;
use crate::barrier::{BarrierCell, BarrierExit};
use crate::context::{ContextState, ThreadStart};
use crate::error::{RuntimeError, RuntimeResult};
use crate::layout::{Completion, ControlWords};
use crate::pool::WorkerPool;
use crate::registry::{ThreadRegistry, ThreadState};
use crate::tls::TlsAllocator;

pub const SPAWN_EXHAUSTED: i32 = -1;
pub const SPAWN_FAILED: i32 = -2;

pub const JOIN_UNKNOWN: i32 = -2;
/// Also returned for ids retired too long ago to tell join from detach
pub const JOIN_ALREADY_JOINED: i32 = -3;
pub const JOIN_DETACHED: i32 = -4;
pub const JOIN_FAILED: i32 = -5;

/// Extra imports installed on every execution context, for collaborators
/// such as a renderer or file-system bridge
pub trait ImportProvider: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, linker: &mut Linker<ContextState>, arena: &SharedArena) -> Result<()>;
}

#[derive(Debug)]
pub struct HostCalls {
    arena: SharedArena,
    pool: WorkerPool,
    registry: ThreadRegistry,
    control: OnceLock<ControlWords>,
    tls: OnceLock<TlsAllocator>,
    core_count: usize,
    enable_logging: bool,
}

impl HostCalls {
    pub fn new(arena: SharedArena, core_count: usize, enable_logging: bool) -> Self {
        Self {
            arena,
            pool: WorkerPool::new(enable_logging),
            registry: ThreadRegistry::new(enable_logging),
            control: OnceLock::new(),
            tls: OnceLock::new(),
            core_count,
            enable_logging,
        }
    }

    /// Publish the negotiated layout; may only happen once
    pub fn install(&self, control: ControlWords, tls: TlsAllocator) -> RuntimeResult<()> {
        self.control
            .set(control)
            .map_err(|_| RuntimeError::Generic(anyhow!("Control words installed twice")))?;
        self.tls
            .set(tls)
            .map_err(|_| RuntimeError::Generic(anyhow!("TLS allocator installed twice")))?;
        Ok(())
    }

    pub fn control(&self) -> RuntimeResult<&ControlWords> {
        self.control.get().ok_or(RuntimeError::NotReady)
    }

    pub fn tls(&self) -> Option<&TlsAllocator> {
        self.tls.get()
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    pub fn spawn(&self, start: ThreadStart) -> RuntimeResult<u32> {
        let control = self.control()?;
        self.registry.spawn(&self.pool, control.flags(), start)
    }

    pub fn join(&self, thread_id: u32) -> RuntimeResult<Completion> {
        let control = self.control()?;
        self.registry.join(&self.pool, control.flags(), thread_id)
    }

    pub fn detach_cleanup(&self, thread_id: u32) -> RuntimeResult<()> {
        let control = self.control()?;
        self.registry
            .detach_cleanup(&self.pool, control.flags(), thread_id)
    }

    pub fn thread_state(&self, thread_id: u32) -> RuntimeResult<Option<ThreadState>> {
        let control = self.control()?;
        self.registry.state(control.flags(), thread_id)
    }

    pub fn barrier(&self, barrier_id: u32) -> RuntimeResult<BarrierCell> {
        self.control()?.barriers().get(barrier_id)
    }

    pub fn barrier_wait(&self, barrier_id: u32) -> RuntimeResult<BarrierExit> {
        let exit = self.barrier(barrier_id)?.wait()?;
        if self.enable_logging && exit.leader {
            log::debug!("Barrier {} released", barrier_id);
        }
        Ok(exit)
    }
}

fn spawn_code(result: RuntimeResult<u32>) -> i32 {
    match result {
        Ok(thread_id) => thread_id as i32,
        Err(RuntimeError::PoolExhausted { pool_size }) => {
            log::error!("Thread spawn failed: all {} workers busy", pool_size);
            SPAWN_EXHAUSTED
        }
        Err(e) => {
            log::error!("Thread spawn failed: {}", e);
            SPAWN_FAILED
        }
    }
}

fn join_code(result: RuntimeResult<Completion>) -> i32 {
    match result {
        Ok(completion) => completion.as_raw(),
        Err(e) => {
            log::error!("Thread join failed: {}", e);
            match e {
                RuntimeError::UnknownThread(_) => JOIN_UNKNOWN,
                RuntimeError::AlreadyJoined(_) | RuntimeError::Retired(_) => JOIN_ALREADY_JOINED,
                RuntimeError::JoinAfterDetach(_) => JOIN_DETACHED,
                _ => JOIN_FAILED,
            }
        }
    }
}

fn upgrade(host: &Weak<HostCalls>) -> RuntimeResult<std::sync::Arc<HostCalls>> {
    host.upgrade()
        .ok_or_else(|| RuntimeError::Generic(anyhow!("Runtime has been dropped")))
}

/// Set up the threading imports in the linker
pub fn setup_host_linker(host: Weak<HostCalls>, linker: &mut Linker<ContextState>) -> Result<()> {
    let spawn_host = host.clone();
    linker
        .func_wrap(
            "env",
            "__thread_spawn",
            move |caller: Caller<'_, ContextState>,
                  func_ptr: i32,
                  arg_ptr: i32,
                  stack_top: i32,
                  tls_base: i32|
                  -> i32 {
                log::trace!("__thread_spawn from {}", caller.data().label());
                let start = ThreadStart {
                    func_ptr: func_ptr as u32,
                    arg_ptr: arg_ptr as u32,
                    stack_top: stack_top as u32,
                    tls_base: tls_base as u32,
                };
                spawn_code(upgrade(&spawn_host).and_then(|host| host.spawn(start)))
            },
        )
        .map_err(|e| anyhow!("Failed to wrap __thread_spawn function: {:?}", e))?;

    let join_host = host.clone();
    linker
        .func_wrap(
            "env",
            "__thread_join",
            move |_caller: Caller<'_, ContextState>, thread_id: i32| -> i32 {
                join_code(upgrade(&join_host).and_then(|host| host.join(thread_id as u32)))
            },
        )
        .map_err(|e| anyhow!("Failed to wrap __thread_join function: {:?}", e))?;

    let cleanup_host = host.clone();
    linker
        .func_wrap(
            "env",
            "__thread_cleanup",
            move |_caller: Caller<'_, ContextState>, thread_id: i32| {
                let result =
                    upgrade(&cleanup_host).and_then(|host| host.detach_cleanup(thread_id as u32));
                if let Err(e) = result {
                    log::error!("Cleanup of thread {} failed: {}", thread_id, e);
                }
            },
        )
        .map_err(|e| anyhow!("Failed to wrap __thread_cleanup function: {:?}", e))?;

    let barrier_host = host.clone();
    linker
        .func_wrap(
            "env",
            "__barrier_wait",
            move |caller: Caller<'_, ContextState>, barrier_id: i32| -> Result<()> {
                let host = upgrade(&barrier_host)?;
                host.barrier_wait(barrier_id as u32).map(|_| ()).map_err(|e| {
                    log::error!(
                        "Barrier wait on {} from {} failed: {}",
                        barrier_id,
                        caller.data().label(),
                        e
                    );
                    anyhow::Error::from(e)
                })
            },
        )
        .map_err(|e| anyhow!("Failed to wrap __barrier_wait function: {:?}", e))?;

    linker
        .func_wrap(
            "env",
            "__core_count",
            move |_caller: Caller<'_, ContextState>| -> i32 {
                match host.upgrade() {
                    Some(host) => host.core_count() as i32,
                    None => 1,
                }
            },
        )
        .map_err(|e| anyhow!("Failed to wrap __core_count function: {:?}", e))?;

    Ok(())
}

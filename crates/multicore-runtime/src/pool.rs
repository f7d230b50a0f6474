//! Worker pool of pre-instantiated execution contexts
//!
//! The pool is sized once at startup. Every slot is either ready (idle,
//! waiting for a run request) or busy (running a thread, or holding a
//! finished thread that has not been joined or cleaned up yet). There is no
//! queueing: when no slot is ready, acquisition fails immediately.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};

use crate::arena::SharedArena;
use crate::context::{ExecutionContext, RunRequest};
use crate::error::{lock_err, RuntimeError, RuntimeResult};
use crate::host::{HostCalls, ImportProvider};
use crate::loader::GuestModule;

/// One execution context and its availability
#[derive(Debug)]
pub struct WorkerSlot {
    pub index: usize,
    pub context: ExecutionContext,
    pub ready: bool,
    /// Set by shutdown; a closed slot never becomes ready again
    pub closed: bool,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub ready: usize,
    pub busy: usize,
}

impl PoolStats {
    pub fn utilization_percentage(&self) -> f64 {
        if self.pool_size == 0 {
            0.0
        } else {
            (self.busy as f64 / self.pool_size as f64) * 100.0
        }
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Mutex<Vec<WorkerSlot>>,
    enable_logging: bool,
}

impl WorkerPool {
    pub fn new(enable_logging: bool) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            enable_logging,
        }
    }

    /// Start `pool_size` execution contexts and wait until every one of them
    /// has instantiated the guest.
    ///
    /// Contexts are launched together and instantiate in parallel. The first
    /// failure aborts the preload; contexts already started are shut down
    /// when their handles drop.
    pub async fn preload(
        &self,
        pool_size: usize,
        module: &GuestModule,
        arena: &SharedArena,
        host: Weak<HostCalls>,
        providers: &[Arc<dyn ImportProvider>],
    ) -> RuntimeResult<()> {
        if self.enable_logging {
            log::info!("Preloading worker pool with {} execution contexts", pool_size);
        }

        let first = self.size()?;
        let mut pending = Vec::with_capacity(pool_size);
        for offset in 0..pool_size {
            let index = first + offset;
            let launched = ExecutionContext::launch(
                index,
                module.clone(),
                arena.clone(),
                host.clone(),
                providers.to_vec(),
            )
            .map_err(|e| RuntimeError::Instantiation {
                index,
                message: format!("{:#}", e),
            })?;
            pending.push(launched);
        }

        let mut contexts = Vec::with_capacity(pool_size);
        for (context, ready) in pending {
            let index = context.index();
            match ready.await {
                Ok(Ok(())) => {
                    if self.enable_logging {
                        log::debug!("Execution context {} of {} instantiated", index + 1, pool_size);
                    }
                }
                Ok(Err(e)) => {
                    return Err(RuntimeError::Instantiation {
                        index,
                        message: format!("{:#}", e),
                    })
                }
                Err(_) => {
                    return Err(RuntimeError::Instantiation {
                        index,
                        message: "context exited before reporting".to_string(),
                    })
                }
            }
            contexts.push(context);
        }

        let mut slots = self.slots.lock().map_err(lock_err)?;
        for context in contexts {
            slots.push(WorkerSlot {
                index: context.index(),
                context,
                ready: true,
                closed: false,
            });
        }

        if self.enable_logging {
            log::info!("Worker pool ready with {} execution contexts", slots.len());
        }
        Ok(())
    }

    /// Claim the first ready slot
    pub fn acquire(&self) -> RuntimeResult<usize> {
        let mut slots = self.slots.lock().map_err(lock_err)?;
        let pool_size = slots.len();
        match slots.iter_mut().find(|slot| slot.ready) {
            Some(slot) => {
                slot.ready = false;
                Ok(slot.index)
            }
            None => Err(RuntimeError::PoolExhausted { pool_size }),
        }
    }

    pub fn release(&self, index: usize) -> RuntimeResult<()> {
        let mut slots = self.slots.lock().map_err(lock_err)?;
        let slot = slots
            .get_mut(index)
            .ok_or_else(|| RuntimeError::Generic(anyhow!("No worker slot {}", index)))?;
        if slot.closed {
            log::debug!("Worker slot {} released after shutdown, staying closed", index);
            return Ok(());
        }
        if slot.ready {
            log::warn!("Worker slot {} released twice", index);
        }
        slot.ready = true;
        Ok(())
    }

    /// Hand a run request to the context in a slot previously acquired
    pub fn dispatch(&self, index: usize, request: RunRequest) -> RuntimeResult<()> {
        let slots = self.slots.lock().map_err(lock_err)?;
        let slot = slots
            .get(index)
            .ok_or_else(|| RuntimeError::Generic(anyhow!("No worker slot {}", index)))?;
        slot.context.dispatch(request).map_err(|e| {
            log::error!("{:#}", e);
            RuntimeError::Dispatch { index }
        })
    }

    pub fn size(&self) -> RuntimeResult<usize> {
        Ok(self.slots.lock().map_err(lock_err)?.len())
    }

    pub fn ready_count(&self) -> RuntimeResult<usize> {
        let slots = self.slots.lock().map_err(lock_err)?;
        Ok(slots.iter().filter(|slot| slot.ready).count())
    }

    pub fn is_ready(&self, index: usize) -> RuntimeResult<bool> {
        let slots = self.slots.lock().map_err(lock_err)?;
        Ok(slots.get(index).map(|slot| slot.ready).unwrap_or(false))
    }

    pub fn stats(&self) -> RuntimeResult<PoolStats> {
        let slots = self.slots.lock().map_err(lock_err)?;
        let ready = slots.iter().filter(|slot| slot.ready).count();
        Ok(PoolStats {
            pool_size: slots.len(),
            ready,
            busy: slots.len() - ready,
        })
    }

    /// Close every context. Idle contexts are joined; busy ones exit on
    /// their own once their current thread finishes.
    pub fn shutdown(&self) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|e| anyhow!("Mutex lock error: {}", e))?;
        for slot in slots.iter_mut() {
            slot.context.close(slot.ready);
            slot.ready = false;
            slot.closed = true;
        }
        if self.enable_logging {
            log::info!("Worker pool shut down ({} contexts)", slots.len());
        }
        Ok(())
    }
}

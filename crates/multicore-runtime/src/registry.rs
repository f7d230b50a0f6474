//! Thread registry: spawn, join and detach bookkeeping
//!
//! A thread is live from spawn until it is joined or cleaned up after a
//! detach. Finished threads stay live (holding their worker slot) until one of
//! those happens. The most recent retirements are remembered so that joining
//! them again can be reported precisely; older ids are still recognised as
//! retired because ids are handed out in increasing order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::context::{RunRequest, ThreadStart};
use crate::error::{lock_err, RuntimeError, RuntimeResult};
use crate::layout::{Completion, FlagArray};
use crate::pool::WorkerPool;

/// Bookkeeping for one live thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadHandle {
    pub thread_id: u32,
    pub slot: usize,
    pub flag_index: u32,
}

/// Number of retirements whose kind is remembered
pub const RETIRED_HISTORY: usize = 256;

/// How a thread left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retirement {
    Joined,
    Detached,
    /// Retired long enough ago that the kind is no longer recorded
    Expired,
}

/// Bounded record of recent retirements, oldest first
#[derive(Debug, Default)]
struct RetiredHistory {
    order: VecDeque<u32>,
    kinds: HashMap<u32, Retirement>,
}

impl RetiredHistory {
    fn record(&mut self, thread_id: u32, retirement: Retirement) {
        if self.kinds.insert(thread_id, retirement).is_none() {
            self.order.push_back(thread_id);
        }
        while self.order.len() > RETIRED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.kinds.remove(&oldest);
            }
        }
    }

    fn get(&self, thread_id: u32) -> Option<Retirement> {
        self.kinds.get(&thread_id).copied()
    }

    fn len(&self) -> usize {
        self.kinds.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    Running,
    /// Finished, waiting for a join or a detach cleanup
    Finished(Completion),
    Retired(Retirement),
}

#[derive(Debug)]
struct LiveThread {
    handle: ThreadHandle,
    joining: bool,
}

#[derive(Debug)]
pub struct ThreadRegistry {
    next_id: AtomicU32,
    live: Mutex<HashMap<u32, LiveThread>>,
    retired: Mutex<RetiredHistory>,
    enable_logging: bool,
}

impl ThreadRegistry {
    pub fn new(enable_logging: bool) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            live: Mutex::new(HashMap::new()),
            retired: Mutex::new(RetiredHistory::default()),
            enable_logging,
        }
    }

    /// Start a thread on the first ready worker and return its id
    pub fn spawn(
        &self,
        pool: &WorkerPool,
        flags: &FlagArray,
        start: ThreadStart,
    ) -> RuntimeResult<u32> {
        let slot = pool.acquire()?;
        match self.start_on(slot, pool, flags, start) {
            Ok(thread_id) => Ok(thread_id),
            Err(e) => {
                pool.release(slot)?;
                Err(e)
            }
        }
    }

    fn start_on(
        &self,
        slot: usize,
        pool: &WorkerPool,
        flags: &FlagArray,
        start: ThreadStart,
    ) -> RuntimeResult<u32> {
        let flag = flags.flag(slot as u32)?;
        flag.reset()?;

        // Registered before dispatch: a detached thread may finish and ask
        // for cleanup before this function returns. The id is issued under
        // the same lock, so any id below `next_id` is either live or retired.
        let thread_id = {
            let mut live = self.live.lock().map_err(lock_err)?;
            let thread_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            live.insert(
                thread_id,
                LiveThread {
                    handle: ThreadHandle {
                        thread_id,
                        slot,
                        flag_index: flag.index(),
                    },
                    joining: false,
                },
            );
            thread_id
        };

        let request = RunRequest {
            thread_id,
            start,
            flag,
        };
        if let Err(e) = pool.dispatch(slot, request) {
            self.live.lock().map_err(lock_err)?.remove(&thread_id);
            return Err(e);
        }

        if self.enable_logging {
            log::debug!(
                "Spawned thread {} on worker {} (func {}, arg {}, stack {:#x})",
                thread_id,
                slot,
                start.func_ptr,
                start.arg_ptr,
                start.stack_top
            );
        }
        Ok(thread_id)
    }

    /// How a thread that is not live left the registry, if it ever existed.
    /// Caller holds the `live` lock.
    fn retirement(&self, thread_id: u32) -> RuntimeResult<Option<Retirement>> {
        let retired = self.retired.lock().map_err(lock_err)?;
        if let Some(retirement) = retired.get(thread_id) {
            return Ok(Some(retirement));
        }
        let issued = thread_id != 0 && thread_id < self.next_id.load(Ordering::SeqCst);
        Ok(issued.then_some(Retirement::Expired))
    }

    fn retired_error(&self, thread_id: u32) -> RuntimeResult<RuntimeError> {
        Ok(match self.retirement(thread_id)? {
            Some(Retirement::Joined) => RuntimeError::AlreadyJoined(thread_id),
            Some(Retirement::Detached) => RuntimeError::JoinAfterDetach(thread_id),
            Some(Retirement::Expired) => RuntimeError::Retired(thread_id),
            None => RuntimeError::UnknownThread(thread_id),
        })
    }

    /// Block until the thread finishes, then release its worker
    pub fn join(
        &self,
        pool: &WorkerPool,
        flags: &FlagArray,
        thread_id: u32,
    ) -> RuntimeResult<Completion> {
        let flag = {
            let mut live = self.live.lock().map_err(lock_err)?;
            match live.get_mut(&thread_id) {
                Some(thread) if thread.joining => {
                    return Err(RuntimeError::AlreadyJoined(thread_id))
                }
                Some(thread) => {
                    thread.joining = true;
                    flags.flag(thread.handle.flag_index)?
                }
                None => return Err(self.retired_error(thread_id)?),
            }
        };

        let completion = flag.wait()?;

        let removed = self.live.lock().map_err(lock_err)?.remove(&thread_id);
        let thread = match removed {
            Some(thread) => thread,
            // Cleaned up as detached while we were waiting
            None => return Err(RuntimeError::JoinAfterDetach(thread_id)),
        };
        self.retired
            .lock()
            .map_err(lock_err)?
            .record(thread_id, Retirement::Joined);
        pool.release(thread.handle.slot)?;

        if self.enable_logging {
            log::debug!(
                "Joined thread {} ({:?}), worker {} ready",
                thread_id,
                completion,
                thread.handle.slot
            );
        }
        Ok(completion)
    }

    /// Forget a detached thread that has finished and release its worker.
    ///
    /// Repeating the cleanup for an already cleaned-up thread is harmless.
    pub fn detach_cleanup(
        &self,
        pool: &WorkerPool,
        flags: &FlagArray,
        thread_id: u32,
    ) -> RuntimeResult<()> {
        let thread = {
            let mut live = self.live.lock().map_err(lock_err)?;
            let Some(thread) = live.get(&thread_id) else {
                return match self.retired_error(thread_id)? {
                    RuntimeError::JoinAfterDetach(_) | RuntimeError::Retired(_) => Ok(()),
                    other => Err(other),
                };
            };
            if flags.flag(thread.handle.flag_index)?.status()? == Completion::Running {
                return Err(RuntimeError::StillRunning(thread_id));
            }
            match live.remove(&thread_id) {
                Some(thread) => thread,
                None => return Err(RuntimeError::UnknownThread(thread_id)),
            }
        };
        self.retired
            .lock()
            .map_err(lock_err)?
            .record(thread_id, Retirement::Detached);
        pool.release(thread.handle.slot)?;

        if self.enable_logging {
            log::debug!(
                "Cleaned up detached thread {}, worker {} ready",
                thread_id,
                thread.handle.slot
            );
        }
        Ok(())
    }

    pub fn state(&self, flags: &FlagArray, thread_id: u32) -> RuntimeResult<Option<ThreadState>> {
        let live = self.live.lock().map_err(lock_err)?;
        if let Some(thread) = live.get(&thread_id) {
            let state = match flags.flag(thread.handle.flag_index)?.status()? {
                Completion::Running => ThreadState::Running,
                completion => ThreadState::Finished(completion),
            };
            return Ok(Some(state));
        }
        Ok(self.retirement(thread_id)?.map(ThreadState::Retired))
    }

    pub fn handle(&self, thread_id: u32) -> RuntimeResult<Option<ThreadHandle>> {
        let live = self.live.lock().map_err(lock_err)?;
        Ok(live.get(&thread_id).map(|thread| thread.handle))
    }

    pub fn live_count(&self) -> RuntimeResult<usize> {
        Ok(self.live.lock().map_err(lock_err)?.len())
    }

    /// Retirements currently remembered, at most [`RETIRED_HISTORY`]
    pub fn retired_count(&self) -> RuntimeResult<usize> {
        Ok(self.retired.lock().map_err(lock_err)?.len())
    }
}

//! Reusable barriers over shared-memory words
//!
//! Each barrier is four `i32` words laid out as
//! `[count, generation, arrived, leaving]`. A wait runs in two phases:
//!
//! 1. Arrive. A participant first blocks until `leaving == 0`, so it can
//!    never register for cycle N+1 while someone is still exiting cycle N.
//!    It then captures `generation` and increments `arrived`. The last
//!    arriver resets `arrived`, sets `leaving = count`, flips `generation`
//!    and wakes the waiters; everyone else waits for the flip.
//! 2. Leave. Every participant decrements `leaving`; the one that brings it
//!    to zero wakes arrivals parked on the drain guard.
//!
//! There is no timeout: a participant that never arrives stalls the others.

use serde::{Deserialize, Serialize};

use crate::arena::SharedArena;
use crate::error::{RuntimeError, RuntimeResult};

/// Bytes occupied by one barrier
pub const BARRIER_STRIDE: u32 = 16;

const COUNT: u32 = 0;
const GENERATION: u32 = 4;
const ARRIVED: u32 = 8;
const LEAVING: u32 = 12;

/// The four control words of a barrier at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSnapshot {
    pub count: i32,
    pub generation: i32,
    pub arrived: i32,
    pub leaving: i32,
}

/// Result of a completed barrier wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierExit {
    /// True for the participant whose arrival released the cycle
    pub leader: bool,
}

#[derive(Debug, Clone)]
pub struct BarrierCell {
    arena: SharedArena,
    id: u32,
    base: u32,
}

impl BarrierCell {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Set the participant count and clear the cycle state.
    ///
    /// Must happen before the first cycle; reconfiguring a barrier that has
    /// waiters is a caller error.
    pub fn configure(&self, count: u32) -> RuntimeResult<()> {
        self.arena.store(self.base + GENERATION, 0)?;
        self.arena.store(self.base + ARRIVED, 0)?;
        self.arena.store(self.base + LEAVING, 0)?;
        self.arena.store(self.base + COUNT, count as i32)
    }

    pub fn snapshot(&self) -> RuntimeResult<BarrierSnapshot> {
        Ok(BarrierSnapshot {
            count: self.arena.load(self.base + COUNT)?,
            generation: self.arena.load(self.base + GENERATION)?,
            arrived: self.arena.load(self.base + ARRIVED)?,
            leaving: self.arena.load(self.base + LEAVING)?,
        })
    }

    pub fn wait(&self) -> RuntimeResult<BarrierExit> {
        let arena = &self.arena;
        let count = arena.load(self.base + COUNT)?;
        if count <= 0 {
            return Err(RuntimeError::BarrierUnconfigured(self.id));
        }

        // Drain guard. Wait with the value just loaded so a concurrent
        // decrement between the check and the wait cannot be missed.
        loop {
            let leaving = arena.load(self.base + LEAVING)?;
            if leaving == 0 {
                break;
            }
            arena.wait(self.base + LEAVING, leaving)?;
        }

        let my_generation = arena.load(self.base + GENERATION)?;
        let arrived = arena.fetch_add(self.base + ARRIVED, 1)? + 1;
        let leader = arrived == count;

        if leader {
            arena.store(self.base + ARRIVED, 0)?;
            arena.store(self.base + LEAVING, count)?;
            arena.store(self.base + GENERATION, 1 - my_generation)?;
            arena.notify_all(self.base + GENERATION)?;
        } else {
            while arena.load(self.base + GENERATION)? == my_generation {
                arena.wait(self.base + GENERATION, my_generation)?;
            }
        }

        let still_leaving = arena.fetch_sub(self.base + LEAVING, 1)? - 1;
        if still_leaving == 0 {
            arena.notify_all(self.base + LEAVING)?;
        }

        Ok(BarrierExit { leader })
    }
}

/// The guest's barrier array
#[derive(Debug, Clone)]
pub struct BarrierTable {
    arena: SharedArena,
    base: u32,
    capacity: u32,
}

impl BarrierTable {
    pub fn new(arena: SharedArena, base: u32, capacity: u32) -> Self {
        Self {
            arena,
            base,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn get(&self, id: u32) -> RuntimeResult<BarrierCell> {
        if id >= self.capacity {
            return Err(RuntimeError::UnknownBarrier {
                id,
                capacity: self.capacity,
            });
        }
        Ok(BarrierCell {
            arena: self.arena.clone(),
            id,
            base: self.base + id * BARRIER_STRIDE,
        })
    }
}

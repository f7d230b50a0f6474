//! Control-word layout negotiated with the guest
//!
//! The guest owns the storage for the completion-flag array and the barrier
//! array and reports their byte offsets through exported getters. Capacities
//! come from the config or from the optional `*_len` getters.

use serde::{Deserialize, Serialize};

use crate::arena::SharedArena;
use crate::barrier::{BarrierTable, BARRIER_STRIDE};
use crate::error::{RuntimeError, RuntimeResult};

/// Size of one completion flag cell
pub const FLAG_STRIDE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaLayout {
    pub flags_base: u32,
    pub flag_capacity: u32,
    pub barriers_base: u32,
    pub barrier_capacity: u32,
}

impl ArenaLayout {
    fn region_end(base: u32, capacity: u32, stride: u32) -> u64 {
        base as u64 + capacity as u64 * stride as u64
    }

    /// Byte ranges `(name, start, end)` of the runtime-owned arrays
    pub fn ranges(&self) -> [(&'static str, u64, u64); 2] {
        [
            (
                "completion flags",
                self.flags_base as u64,
                Self::region_end(self.flags_base, self.flag_capacity, FLAG_STRIDE),
            ),
            (
                "barriers",
                self.barriers_base as u64,
                Self::region_end(self.barriers_base, self.barrier_capacity, BARRIER_STRIDE),
            ),
        ]
    }

    /// Check alignment, that both arrays lie inside the arena and that they
    /// do not overlap
    pub fn validate(&self, arena: &SharedArena) -> RuntimeResult<()> {
        for base in [self.flags_base, self.barriers_base] {
            if base % 4 != 0 {
                return Err(RuntimeError::Misaligned(base));
            }
        }
        let size = arena.size_bytes();
        for (_, start, end) in self.ranges() {
            if end > size {
                return Err(RuntimeError::OutOfBounds {
                    offset: start as u32,
                    len: u32::try_from(end - start).unwrap_or(u32::MAX),
                });
            }
        }
        let [(name, start, end), _] = self.ranges();
        self.check_disjoint(name, start, end)
    }

    /// Reject a byte range that intersects any runtime-owned array
    pub fn check_disjoint(&self, name: &str, start: u64, end: u64) -> RuntimeResult<()> {
        for (owned, owned_start, owned_end) in self.ranges() {
            if start < owned_end && owned_start < end && owned != name {
                return Err(RuntimeError::LayoutOverlap {
                    first: name.to_string(),
                    second: owned.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Outcome recorded in a completion flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    Running,
    Succeeded,
    Failed,
}

impl Completion {
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => Completion::Running,
            v if v > 0 => Completion::Succeeded,
            _ => Completion::Failed,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Completion::Running => 0,
            Completion::Succeeded => 1,
            Completion::Failed => -1,
        }
    }
}

/// One completion flag cell in shared memory
#[derive(Debug, Clone)]
pub struct CompletionFlag {
    arena: SharedArena,
    index: u32,
    offset: u32,
}

impl CompletionFlag {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn reset(&self) -> RuntimeResult<()> {
        self.arena.store(self.offset, Completion::Running.as_raw())
    }

    pub fn status(&self) -> RuntimeResult<Completion> {
        Ok(Completion::from_raw(self.arena.load(self.offset)?))
    }

    /// Publish the outcome and wake every joiner
    pub fn complete(&self, status: Completion) -> RuntimeResult<()> {
        self.arena.store(self.offset, status.as_raw())?;
        self.arena.notify_all(self.offset)?;
        Ok(())
    }

    /// Block until the flag leaves the running state
    pub fn wait(&self) -> RuntimeResult<Completion> {
        loop {
            let value = self.arena.load(self.offset)?;
            if value != 0 {
                return Ok(Completion::from_raw(value));
            }
            self.arena.wait(self.offset, 0)?;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagArray {
    arena: SharedArena,
    base: u32,
    capacity: u32,
}

impl FlagArray {
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn flag(&self, index: u32) -> RuntimeResult<CompletionFlag> {
        if index >= self.capacity {
            return Err(RuntimeError::FlagOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(CompletionFlag {
            arena: self.arena.clone(),
            index,
            offset: self.base + index * FLAG_STRIDE,
        })
    }
}

/// Typed views over every runtime-owned word group in the arena
#[derive(Debug, Clone)]
pub struct ControlWords {
    layout: ArenaLayout,
    flags: FlagArray,
    barriers: BarrierTable,
}

impl ControlWords {
    pub fn new(arena: SharedArena, layout: ArenaLayout) -> RuntimeResult<Self> {
        layout.validate(&arena)?;
        Ok(Self {
            layout,
            flags: FlagArray {
                arena: arena.clone(),
                base: layout.flags_base,
                capacity: layout.flag_capacity,
            },
            barriers: BarrierTable::new(arena, layout.barriers_base, layout.barrier_capacity),
        })
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn flags(&self) -> &FlagArray {
        &self.flags
    }

    pub fn barriers(&self) -> &BarrierTable {
        &self.barriers
    }
}

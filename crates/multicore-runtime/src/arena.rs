//! Shared memory arena
//!
//! One `wasmtime::SharedMemory` backs the guest's linear memory in every
//! execution context. The host reaches into the same memory for the runtime's
//! control words (completion flags, barrier quads) and performs its atomic
//! operations through `AtomicI32` views over the raw bytes, so host-side and
//! guest-side atomics act on identical cells and share one wait/notify queue.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use wasmtime::{Engine, MemoryType, SharedMemory};

use crate::error::{RuntimeError, RuntimeResult};

/// Size of one WebAssembly page in bytes
pub const WASM_PAGE_SIZE: u64 = 0x10000;

#[derive(Clone)]
pub struct SharedArena {
    memory: SharedMemory,
}

impl fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArena")
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

impl SharedArena {
    /// Allocate a shared memory with the given page limits
    pub fn new(engine: &Engine, minimum_pages: u32, maximum_pages: u32) -> Result<Self> {
        let memory = SharedMemory::new(engine, MemoryType::shared(minimum_pages, maximum_pages))
            .with_context(|| {
                format!(
                    "Failed to allocate shared memory ({} - {} pages)",
                    minimum_pages, maximum_pages
                )
            })?;
        Ok(Self { memory })
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn size_bytes(&self) -> u64 {
        self.memory.data_size() as u64
    }

    /// Grow the arena by `delta_pages`, returning the previous size in pages
    pub fn grow(&self, delta_pages: u64) -> Result<u64> {
        self.memory
            .grow(delta_pages)
            .with_context(|| format!("Failed to grow shared memory by {} pages", delta_pages))
    }

    fn check_range(&self, offset: u32, len: u32) -> RuntimeResult<()> {
        let end = offset as u64 + len as u64;
        if end > self.size_bytes() {
            return Err(RuntimeError::OutOfBounds { offset, len });
        }
        Ok(())
    }

    fn word(&self, offset: u32) -> RuntimeResult<&AtomicI32> {
        if offset % 4 != 0 {
            return Err(RuntimeError::Misaligned(offset));
        }
        self.check_range(offset, 4)?;
        let cell = &self.memory.data()[offset as usize];
        // SAFETY: the range is in bounds and 4-byte aligned (linear memory is
        // page aligned). Shared memories never move or shrink while a handle
        // is alive, and every access to the cell goes through atomics.
        Ok(unsafe { &*(cell.get() as *const AtomicI32) })
    }

    pub fn load(&self, offset: u32) -> RuntimeResult<i32> {
        Ok(self.word(offset)?.load(Ordering::SeqCst))
    }

    pub fn store(&self, offset: u32, value: i32) -> RuntimeResult<()> {
        self.word(offset)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Atomic add, returning the previous value
    pub fn fetch_add(&self, offset: u32, delta: i32) -> RuntimeResult<i32> {
        Ok(self.word(offset)?.fetch_add(delta, Ordering::SeqCst))
    }

    /// Atomic subtract, returning the previous value
    pub fn fetch_sub(&self, offset: u32, delta: i32) -> RuntimeResult<i32> {
        Ok(self.word(offset)?.fetch_sub(delta, Ordering::SeqCst))
    }

    /// Compare-and-swap, returning the value observed before the operation
    pub fn compare_exchange(&self, offset: u32, current: i32, new: i32) -> RuntimeResult<i32> {
        let word = self.word(offset)?;
        Ok(match word.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(previous) => previous,
            Err(previous) => previous,
        })
    }

    /// Block the calling OS thread while the word at `offset` equals `expected`.
    ///
    /// Returns immediately on a value mismatch; spurious wakeups are possible,
    /// so callers re-check their condition in a loop.
    pub fn wait(&self, offset: u32, expected: i32) -> RuntimeResult<()> {
        self.word(offset)?;
        self.memory
            .atomic_wait32(offset as u64, expected as u32, None)?;
        Ok(())
    }

    /// Wake up to `count` waiters blocked on `offset`, returning how many woke
    pub fn notify(&self, offset: u32, count: u32) -> RuntimeResult<u32> {
        self.word(offset)?;
        Ok(self.memory.atomic_notify(offset as u64, count)?)
    }

    pub fn notify_all(&self, offset: u32) -> RuntimeResult<u32> {
        self.notify(offset, u32::MAX)
    }

    pub fn read_bytes(&self, offset: u32, len: u32) -> RuntimeResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len as usize];
        if len == 0 {
            return Ok(out);
        }
        let src = self.memory.data()[offset as usize].get() as *const u8;
        // SAFETY: bounds checked above; the destination is a fresh buffer.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len as usize) };
        Ok(out)
    }

    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> RuntimeResult<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| RuntimeError::OutOfBounds {
            offset,
            len: u32::MAX,
        })?;
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let dst = self.memory.data()[offset as usize].get();
        // SAFETY: bounds checked above; racing guest writes are the guest's
        // own data race, the runtime never writes its control words this way.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, len as usize) };
        Ok(())
    }

    /// Read a UTF-8 string, replacing invalid sequences
    pub fn read_string(&self, offset: u32, len: u32) -> RuntimeResult<String> {
        let bytes = self.read_bytes(offset, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

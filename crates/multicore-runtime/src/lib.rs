//! User-space threading for WebAssembly guests on wasmtime
//!
//! One guest module runs concurrently across a fixed pool of execution
//! contexts, each an independent wasmtime instance on its own OS thread, all
//! importing the same shared linear memory. Thread spawn hands work to an
//! idle context; join, detach and barriers are built from shared-memory words
//! and atomic wait/notify.

// Core modules
pub mod arena;
pub mod barrier;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod layout;
pub mod loader;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod shims;
pub mod tls;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
pub mod tests;

pub use arena::{SharedArena, WASM_PAGE_SIZE};
pub use barrier::{BarrierCell, BarrierExit, BarrierSnapshot, BarrierTable, BARRIER_STRIDE};
pub use config::{MemoryLimits, RuntimeConfig};
pub use context::{ContextState, ThreadStart};
pub use error::{RuntimeError, RuntimeResult};
pub use host::{HostCalls, ImportProvider};
pub use layout::{ArenaLayout, Completion, CompletionFlag, ControlWords};
pub use loader::GuestModule;
pub use pool::{PoolStats, WorkerPool};
pub use registry::{Retirement, ThreadHandle, ThreadRegistry, ThreadState};
pub use runtime::MulticoreRuntime;
pub use tls::TlsAllocator;

//! Test modules for multicore-runtime
//!
//! Arena and barrier tests drive the host-side primitives directly; the
//! runtime tests preload the WAT guest from `test_utils` and exercise spawn,
//! join, detach, TLS and the host call surface end to end.

pub mod arena_test;
pub mod barrier_test;
pub mod layout_test;

use crate::arena::SharedArena;
use crate::loader::new_engine;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bare one-page arena for host-only tests
pub(crate) fn test_arena() -> SharedArena {
    let engine = new_engine().unwrap();
    SharedArena::new(&engine, 1, 1).unwrap()
}

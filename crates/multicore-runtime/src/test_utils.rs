//! Guest fixture and helpers shared by unit and end-to-end tests
//!
//! `GUEST_WAT` is a small hand-written guest that follows the runtime's ABI:
//! shared `env.memory`, an indirect function table of thread entry points,
//! `__stack_pointer`, LLVM-style TLS exports, a guest-side detach protocol and
//! the control-word getters.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::loader::GuestModule;

pub const FLAGS_BASE: u32 = 0x400;
pub const FLAGS_LEN: u32 = 32;
pub const BARRIERS_BASE: u32 = 0x800;
pub const BARRIERS_LEN: u32 = 8;
pub const TLS_REGION: u32 = 0x1000;
pub const TLS_REGION_LEN: u32 = 0x1000;
/// Guest-side detach state per thread id: 0 running, 1 detached, 2 exited
pub const DETACH_CELLS: u32 = 0x2000;
pub const COUNTER: u32 = 0x3000;
/// Free words for individual tests, well clear of everything above
pub const SCRATCH: u32 = 0x3100;
pub const GREETING: u32 = 0x4000;

/// Value `__wasm_init_tls` writes at the start of every TLS block
pub const TLS_MARKER: i32 = 7;

// Indirect function table entries
pub const FN_INCREMENT: u32 = 1;
pub const FN_FAIL: u32 = 2;
pub const FN_BARRIER_INCREMENT: u32 = 3;
pub const FN_GATED: u32 = 4;
pub const FN_RECORD_SP: u32 = 5;
pub const FN_RECORD_TLS: u32 = 6;
pub const FN_PROBE: u32 = 7;
pub const FN_SPAWN_NESTED: u32 = 8;
pub const FN_LOG: u32 = 9;

pub const GUEST_WAT: &str = r#"
(module
  (import "env" "memory" (memory 4 16 shared))
  (import "env" "__thread_spawn" (func $spawn (param i32 i32 i32 i32) (result i32)))
  (import "env" "__thread_join" (func $join (param i32) (result i32)))
  (import "env" "__thread_cleanup" (func $cleanup (param i32)))
  (import "env" "__barrier_wait" (func $barrier_wait (param i32)))
  (import "env" "__core_count" (func $core_count (result i32)))
  (import "env" "__log" (func $log (param i32 i32)))
  (import "test" "probe" (func $probe (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))

  (global $sp (export "__stack_pointer") (mut i32) (i32.const 0x10000))
  (global $tls_base (mut i32) (i32.const 0))
  (global (export "__tls_size") i32 (i32.const 16))
  (global (export "__tls_align") i32 (i32.const 8))

  (table (export "__indirect_function_table") 16 funcref)
  (elem (i32.const 1)
    $increment $fail $barrier_increment $gated $record_sp
    $record_tls $probe_into $spawn_nested $log_message)

  (data (i32.const 0x4000) "hello from guest")

  (func $increment (param $arg i32)
    (drop (i32.atomic.rmw.add (local.get $arg) (i32.const 1))))

  (func $fail (param $arg i32)
    unreachable)

  (func $barrier_increment (param $arg i32)
    (call $barrier_wait (i32.const 0))
    (drop (i32.atomic.rmw.add (local.get $arg) (i32.const 1))))

  ;; Blocks until the word at $arg becomes non-zero, then bumps $arg + 4
  (func $gated (param $arg i32)
    (block $open
      (loop $closed
        (br_if $open (i32.atomic.load (local.get $arg)))
        (drop (memory.atomic.wait32 (local.get $arg) (i32.const 0) (i64.const -1)))
        (br $closed)))
    (drop (i32.atomic.rmw.add offset=4 (local.get $arg) (i32.const 1))))

  (func $record_sp (param $arg i32)
    (i32.atomic.store (local.get $arg) (global.get $sp)))

  (func $record_tls (param $arg i32)
    (i32.atomic.store (local.get $arg) (global.get $tls_base))
    (i32.atomic.store offset=4 (local.get $arg) (i32.load (global.get $tls_base))))

  (func $probe_into (param $arg i32)
    (i32.atomic.store (local.get $arg) (call $probe (i32.load (local.get $arg)))))

  ;; $arg: child stack top, then the join result, then the child's counter
  (func $spawn_nested (param $arg i32)
    (local $tid i32)
    (local.set $tid
      (call $spawn
        (i32.const 1)
        (i32.add (local.get $arg) (i32.const 8))
        (i32.load (local.get $arg))
        (i32.const 0)))
    (if (i32.lt_s (local.get $tid) (i32.const 0))
      (then
        (i32.atomic.store offset=4 (local.get $arg) (local.get $tid))
        (return)))
    (i32.atomic.store offset=4 (local.get $arg) (call $join (local.get $tid))))

  (func $log_message (param $arg i32)
    (call $log (i32.const 0x4000) (i32.const 16)))

  (func (export "__wasm_init_tls") (param $base i32)
    (global.set $tls_base (local.get $base))
    (i32.store (local.get $base) (i32.const 7)))

  (func $detach_cell (param $id i32) (result i32)
    (i32.add (i32.const 0x2000) (i32.shl (local.get $id) (i32.const 2))))

  ;; 0 -> 2 marks the thread exited; a 1 left by an earlier detach means the
  ;; runtime must clean it up
  (func (export "thread_exit_check") (param $id i32) (result i32)
    (i32.eq
      (i32.atomic.rmw.cmpxchg (call $detach_cell (local.get $id)) (i32.const 0) (i32.const 2))
      (i32.const 1)))

  (func (export "thread_detach") (param $id i32)
    (if (i32.eq
          (i32.atomic.rmw.cmpxchg (call $detach_cell (local.get $id)) (i32.const 0) (i32.const 1))
          (i32.const 2))
      (then (call $cleanup (local.get $id)))))

  (func (export "get_thread_flags_ptr") (result i32) (i32.const 0x400))
  (func (export "get_thread_flags_len") (result i32) (i32.const 32))
  (func (export "get_barrier_data_ptr") (result i32) (i32.const 0x800))
  (func (export "get_barrier_data_len") (result i32) (i32.const 8))
  (func (export "get_tls_region_ptr") (result i32) (i32.const 0x1000))
  (func (export "get_tls_region_len") (result i32) (i32.const 0x1000))

  (func (export "guest_core_count") (result i32)
    (call $core_count))

  (func (export "exit_main") (result i32)
    (call $proc_exit (i32.const 3))
    (i32.const 0))

  ;; Four threads meet at barrier 0 and each bump the counter; a fifth spawn
  ;; must be refused while they hold every worker
  (func (export "wasm_main") (result i32)
    (local $t0 i32) (local $t1 i32) (local $t2 i32) (local $t3 i32)
    (i32.atomic.store (i32.const 0x800) (i32.const 4))
    (i32.atomic.store (i32.const 0x3000) (i32.const 0))
    (local.set $t0 (call $spawn (i32.const 3) (i32.const 0x3000) (i32.const 0x21000) (i32.const 0)))
    (local.set $t1 (call $spawn (i32.const 3) (i32.const 0x3000) (i32.const 0x22000) (i32.const 0)))
    (local.set $t2 (call $spawn (i32.const 3) (i32.const 0x3000) (i32.const 0x23000) (i32.const 0)))
    (local.set $t3 (call $spawn (i32.const 3) (i32.const 0x3000) (i32.const 0x24000) (i32.const 0)))
    (if (i32.ne
          (call $spawn (i32.const 1) (i32.const 0x3004) (i32.const 0x25000) (i32.const 0))
          (i32.const -1))
      (then (return (i32.const -100))))
    (drop (call $join (local.get $t0)))
    (drop (call $join (local.get $t1)))
    (drop (call $join (local.get $t2)))
    (drop (call $join (local.get $t3)))
    (i32.atomic.load (i32.const 0x3000)))
)
"#;

/// Stack top for the `n`th test thread; every stack gets 4 KiB
pub fn stack_top(n: u32) -> u32 {
    0x21000 + n * 0x1000
}

/// Every TLS block the fixture declares is 16 bytes, 8-aligned
pub const TLS_BLOCK: u32 = 16;

pub fn guest_module() -> GuestModule {
    GuestModule::from_bytes(GUEST_WAT.as_bytes()).expect("test guest should compile")
}

pub fn test_config(pool_size: usize) -> RuntimeConfig {
    RuntimeConfig {
        pool_size: Some(pool_size),
        core_count: 8,
        enable_logging: true,
        ..Default::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

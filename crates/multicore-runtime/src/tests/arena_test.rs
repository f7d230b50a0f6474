//! Tests for the shared arena's atomic word access

use crate::error::RuntimeError;
use crate::tests::test_arena;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_word_operations() {
    let arena = test_arena();
    assert_eq!(arena.size_bytes(), 0x10000);
    assert_eq!(arena.load(64).unwrap(), 0);

    arena.store(64, 41).unwrap();
    assert_eq!(arena.fetch_add(64, 1).unwrap(), 41);
    assert_eq!(arena.load(64).unwrap(), 42);
    assert_eq!(arena.fetch_sub(64, 2).unwrap(), 42);
    assert_eq!(arena.load(64).unwrap(), 40);

    // Failed exchange reports the current value and changes nothing
    assert_eq!(arena.compare_exchange(64, 0, 5).unwrap(), 40);
    assert_eq!(arena.load(64).unwrap(), 40);
    assert_eq!(arena.compare_exchange(64, 40, 5).unwrap(), 40);
    assert_eq!(arena.load(64).unwrap(), 5);
}

#[test]
fn test_rejects_bad_offsets() {
    let arena = test_arena();
    assert!(matches!(arena.load(2), Err(RuntimeError::Misaligned(2))));
    assert!(matches!(
        arena.store(0x10000, 1),
        Err(RuntimeError::OutOfBounds { offset: 0x10000, len: 4 })
    ));
    assert!(arena.read_bytes(0xFFF0, 32).is_err());
    assert!(arena.notify_all(3).is_err());
}

#[test]
fn test_byte_access() {
    let arena = test_arena();
    arena.write_bytes(100, b"shared bytes").unwrap();
    assert_eq!(arena.read_bytes(100, 6).unwrap(), b"shared".to_vec());
    assert_eq!(arena.read_string(107, 5).unwrap(), "bytes");
    assert!(arena.read_bytes(0, 0).unwrap().is_empty());

    arena.write_bytes(200, &[0xff, 0xfe]).unwrap();
    assert_eq!(arena.read_string(200, 2).unwrap(), "\u{fffd}\u{fffd}");
}

#[test]
fn test_wait_returns_on_value_mismatch() {
    let arena = test_arena();
    arena.store(128, 1).unwrap();
    // Expected value differs, so this must not block
    arena.wait(128, 0).unwrap();
}

#[test]
fn test_notify_wakes_waiter() {
    let arena = test_arena();
    let woke = Arc::new(AtomicBool::new(false));

    let waiter = {
        let arena = arena.clone();
        let woke = woke.clone();
        thread::spawn(move || {
            while arena.load(256).unwrap() == 0 {
                arena.wait(256, 0).unwrap();
            }
            woke.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!woke.load(Ordering::SeqCst));

    arena.store(256, 1).unwrap();
    arena.notify_all(256).unwrap();
    waiter.join().unwrap();
    assert!(woke.load(Ordering::SeqCst));
}

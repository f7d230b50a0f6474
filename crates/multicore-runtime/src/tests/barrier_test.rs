//! Tests for the four-word barrier
//!
//! These run the barrier from plain OS threads against a bare arena, which is
//! exactly what pool contexts do when the guest calls `__barrier_wait`.

use crate::barrier::{BarrierTable, BARRIER_STRIDE};
use crate::error::RuntimeError;
use crate::test_utils::wait_until;
use crate::tests::{init_logging, test_arena};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const BASE: u32 = 0x100;

fn table() -> BarrierTable {
    BarrierTable::new(test_arena(), BASE, 4)
}

#[test]
fn test_barrier_is_reusable() {
    init_logging();
    const CYCLES: usize = 20;

    for count in 1..=5usize {
        let barriers = table();
        let barrier = barriers.get(1).unwrap();
        barrier.configure(count as u32).unwrap();

        let arrivals: Arc<Vec<AtomicUsize>> =
            Arc::new((0..CYCLES).map(|_| AtomicUsize::new(0)).collect());
        let leaders: Arc<Vec<AtomicUsize>> =
            Arc::new((0..CYCLES).map(|_| AtomicUsize::new(0)).collect());

        let participants: Vec<_> = (0..count)
            .map(|_| {
                let barrier = barrier.clone();
                let arrivals = arrivals.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    for cycle in 0..CYCLES {
                        arrivals[cycle].fetch_add(1, Ordering::SeqCst);
                        let exit = barrier.wait().unwrap();
                        // Nobody leaves a cycle before everyone arrived in it
                        assert_eq!(arrivals[cycle].load(Ordering::SeqCst), count);
                        if exit.leader {
                            leaders[cycle].fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for participant in participants {
            participant.join().unwrap();
        }

        for cycle in 0..CYCLES {
            assert_eq!(leaders[cycle].load(Ordering::SeqCst), 1, "count {} cycle {}", count, cycle);
        }

        let snapshot = barrier.snapshot().unwrap();
        assert_eq!(snapshot.count, count as i32);
        assert_eq!(snapshot.arrived, 0);
        assert_eq!(snapshot.leaving, 0);
        assert_eq!(snapshot.generation, (CYCLES % 2) as i32);
    }
}

#[test]
fn test_arrival_waits_for_previous_cycle_to_drain() {
    init_logging();
    let barriers = table();
    let barrier = barriers.get(0).unwrap();
    barrier.configure(3).unwrap();
    let arena = barriers.arena().clone();
    let (generation, arrived, leaving) = (BASE + 4, BASE + 8, BASE + 12);

    // Two participants run two real cycles back to back
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let fast: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let barrier = barrier.clone();
            let events = events.clone();
            thread::spawn(move || {
                for cycle in 1..=2 {
                    barrier.wait().unwrap();
                    events.lock().unwrap().push(format!("{} left cycle {}", name, cycle));
                }
            })
        })
        .collect();

    // The third participant is stepped by hand so it can linger in cycle 1:
    // it arrives last, releases the cycle and then does not leave yet.
    assert!(wait_until(Duration::from_secs(5), || arena.load(arrived).unwrap() == 2));
    assert_eq!(arena.load(leaving).unwrap(), 0);
    let my_generation = arena.load(generation).unwrap();
    assert_eq!(arena.fetch_add(arrived, 1).unwrap() + 1, 3);
    arena.store(arrived, 0).unwrap();
    arena.store(leaving, 3).unwrap();
    arena.store(generation, 1 - my_generation).unwrap();
    arena.notify_all(generation).unwrap();

    // The fast pair leaves through the real path and heads into cycle 2
    assert!(wait_until(Duration::from_secs(5), || events.lock().unwrap().len() == 2));
    assert!(wait_until(Duration::from_secs(5), || arena.load(leaving).unwrap() == 1));
    thread::sleep(Duration::from_millis(100));
    let snapshot = barrier.snapshot().unwrap();
    assert_eq!(snapshot.arrived, 0, "arrival registered while leaving != 0");
    assert_eq!(snapshot.leaving, 1);
    assert_eq!(snapshot.generation, 1);
    assert_eq!(events.lock().unwrap().len(), 2);

    // The straggler leaves cycle 1, then joins cycle 2 for real
    events.lock().unwrap().push("c left cycle 1".to_string());
    if arena.fetch_sub(leaving, 1).unwrap() - 1 == 0 {
        arena.notify_all(leaving).unwrap();
    }
    barrier.wait().unwrap();
    for participant in fast {
        participant.join().unwrap();
    }

    let events = events.lock().unwrap();
    let straggler = events.iter().position(|e| e == "c left cycle 1").unwrap();
    for (i, event) in events.iter().enumerate() {
        if event.ends_with("cycle 2") {
            assert!(i > straggler, "{} before the straggler left", event);
        } else {
            assert!(i <= straggler, "{} after the straggler left", event);
        }
    }
    assert_eq!(events.len(), 5);

    let snapshot = barrier.snapshot().unwrap();
    assert_eq!(snapshot.generation, 0);
    assert_eq!(snapshot.arrived, 0);
    assert_eq!(snapshot.leaving, 0);
}

#[test]
fn test_single_participant_never_blocks() {
    let barriers = table();
    let barrier = barriers.get(3).unwrap();
    barrier.configure(1).unwrap();
    for _ in 0..3 {
        assert!(barrier.wait().unwrap().leader);
    }
    assert_eq!(barrier.snapshot().unwrap().generation, 1);
}

#[test]
fn test_unconfigured_barrier_is_an_error() {
    let barriers = table();
    assert!(matches!(
        barriers.get(2).unwrap().wait(),
        Err(RuntimeError::BarrierUnconfigured(2))
    ));
}

#[test]
fn test_unknown_barrier_id() {
    let barriers = table();
    assert!(matches!(
        barriers.get(4),
        Err(RuntimeError::UnknownBarrier { id: 4, capacity: 4 })
    ));
}

#[test]
fn test_barriers_do_not_overlap() {
    let barriers = table();
    barriers.get(0).unwrap().configure(3).unwrap();
    barriers.get(1).unwrap().configure(5).unwrap();
    assert_eq!(barriers.get(0).unwrap().snapshot().unwrap().count, 3);
    assert_eq!(barriers.get(1).unwrap().snapshot().unwrap().count, 5);
    let arena = barriers.arena().clone();
    assert_eq!(arena.load(BASE + BARRIER_STRIDE).unwrap(), 5);
}

//! Tests for the negotiated control-word layout

use crate::error::RuntimeError;
use crate::layout::{ArenaLayout, ControlWords};
use crate::tests::test_arena;

fn layout() -> ArenaLayout {
    ArenaLayout {
        flags_base: 0x100,
        flag_capacity: 16,
        barriers_base: 0x200,
        barrier_capacity: 4,
    }
}

#[test]
fn test_disjoint_layout_validates() {
    let arena = test_arena();
    layout().validate(&arena).unwrap();
    let control = ControlWords::new(arena, layout()).unwrap();
    assert_eq!(control.flags().capacity(), 16);
    assert_eq!(control.barriers().capacity(), 4);
}

#[test]
fn test_huge_capacity_is_out_of_bounds() {
    let arena = test_arena();
    let mut flags = layout();
    flags.flag_capacity = 1 << 30;
    assert!(matches!(
        flags.validate(&arena),
        Err(RuntimeError::OutOfBounds { offset: 0x100, .. })
    ));

    let mut barriers = layout();
    barriers.barrier_capacity = u32::MAX;
    assert!(matches!(
        barriers.validate(&arena),
        Err(RuntimeError::OutOfBounds { offset: 0x200, len: u32::MAX })
    ));
}

#[test]
fn test_flags_overlapping_barriers_are_rejected() {
    let arena = test_arena();
    let mut overlapping = layout();
    // 0x100 + 65 * 4 runs one word into the barrier array
    overlapping.flag_capacity = 65;
    assert!(matches!(
        overlapping.validate(&arena),
        Err(RuntimeError::LayoutOverlap { .. })
    ));

    overlapping.flag_capacity = 64;
    overlapping.validate(&arena).unwrap();
}

#[test]
fn test_check_disjoint() {
    let layout = layout();
    layout.check_disjoint("tls region", 0x300, 0x400).unwrap();
    layout.check_disjoint("tls region", 0x0, 0x100).unwrap();
    match layout.check_disjoint("tls region", 0x1f0, 0x220) {
        Err(RuntimeError::LayoutOverlap { first, second }) => {
            assert_eq!(first, "tls region");
            assert_eq!(second, "barriers");
        }
        other => panic!("expected an overlap, got {:?}", other),
    }
}

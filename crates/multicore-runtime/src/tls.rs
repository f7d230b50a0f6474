//! Thread-local storage slots
//!
//! Every execution context gets a fixed TLS block inside the arena: slot 0
//! for the main context, slot `i + 1` for pool context `i`. Blocks are
//! `align_up(tls_size, tls_align)` bytes apart, starting at the aligned
//! region base the guest reports.

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// TLS slot of the main (initiating) context
pub const MAIN_SLOT: u32 = 0;

/// TLS slot assigned to pool context `pool_index`
pub fn worker_slot(pool_index: usize) -> u32 {
    pool_index as u32 + 1
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsAllocator {
    region_base: u32,
    tls_size: u32,
    tls_align: u32,
    stride: u32,
    slots: u32,
}

impl TlsAllocator {
    pub fn new(region_base: u32, tls_size: u32, tls_align: u32, slots: u32) -> RuntimeResult<Self> {
        if tls_size == 0 {
            return Ok(Self::disabled());
        }
        let align = tls_align.max(1);
        if !align.is_power_of_two() {
            return Err(RuntimeError::InvalidAbi(format!(
                "TLS alignment {} is not a power of two",
                tls_align
            )));
        }
        let base = align_up(region_base as u64, align as u64);
        let stride = align_up(tls_size as u64, align as u64);
        let end = base + stride * slots as u64;
        if end > u32::MAX as u64 {
            return Err(RuntimeError::InvalidAbi(format!(
                "TLS region of {} slots x {} bytes overflows the address space",
                slots, stride
            )));
        }
        Ok(Self {
            region_base: base as u32,
            tls_size,
            tls_align: align,
            stride: stride as u32,
            slots,
        })
    }

    /// Allocator for a guest without thread-locals
    pub fn disabled() -> Self {
        Self {
            region_base: 0,
            tls_size: 0,
            tls_align: 1,
            stride: 0,
            slots: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tls_size > 0
    }

    pub fn tls_size(&self) -> u32 {
        self.tls_size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// First byte past the last slot
    pub fn region_end(&self) -> u64 {
        self.region_base as u64 + self.stride as u64 * self.slots as u64
    }

    pub fn slot_base(&self, slot: u32) -> RuntimeResult<u32> {
        if slot >= self.slots {
            return Err(RuntimeError::TlsSlotOutOfRange {
                slot,
                slots: self.slots,
            });
        }
        Ok(self.region_base + slot * self.stride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_bases_are_disjoint() {
        for tls_size in [1u32, 3, 4, 16, 17, 100, 4096] {
            for tls_align in [1u32, 4, 8, 16, 64] {
                let tls = TlsAllocator::new(0x1003, tls_size, tls_align, 9).unwrap();
                let mut ranges: Vec<(u32, u32)> = (0..9)
                    .map(|slot| {
                        let base = tls.slot_base(slot).unwrap();
                        (base, base + tls_size)
                    })
                    .collect();
                ranges.sort();
                for pair in ranges.windows(2) {
                    assert!(pair[0].1 <= pair[1].0, "overlap for size {} align {}", tls_size, tls_align);
                }
                for (base, _) in ranges {
                    assert_eq!(base % tls_align, 0);
                }
            }
        }
    }

    #[test]
    fn test_slot_base_is_deterministic() {
        let a = TlsAllocator::new(4096, 24, 8, 5).unwrap();
        let b = TlsAllocator::new(4096, 24, 8, 5).unwrap();
        for slot in 0..5 {
            assert_eq!(a.slot_base(slot).unwrap(), b.slot_base(slot).unwrap());
        }
        assert_eq!(a.slot_base(MAIN_SLOT).unwrap(), 4096);
        assert_eq!(a.slot_base(worker_slot(0)).unwrap(), 4096 + 24);
        assert_eq!(a.region_end(), 4096 + 24 * 5);
    }

    #[test]
    fn test_zero_footprint_disables_tls() {
        let tls = TlsAllocator::new(4096, 0, 8, 5).unwrap();
        assert!(!tls.is_enabled());
        assert!(tls.slot_base(0).is_err());
    }

    #[test]
    fn test_slot_out_of_range() {
        let tls = TlsAllocator::new(0, 16, 8, 2).unwrap();
        assert!(matches!(
            tls.slot_base(2),
            Err(RuntimeError::TlsSlotOutOfRange { slot: 2, slots: 2 })
        ));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        assert!(TlsAllocator::new(0, 16, 12, 2).is_err());
    }
}

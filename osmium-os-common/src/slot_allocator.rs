// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! First-fit allocator for integer-numbered capability slots.
//!
//! Each PD owns one of these to track the free slots of its root CNode.
//! All mutation happens between a `recv` and the matching reply so no
//! locking is needed here.

use bitvec::prelude::*;
use core::ops::Range;
#[cfg(feature = "TRACE_OPS")]
use log::trace;

pub struct SlotAllocator {
    bits: BitBox<u8, Lsb0>,
    used: usize,
    base_slot: usize,
}

impl SlotAllocator {
    /// Tracks `size` slots starting at `first_slot`.
    pub fn new(first_slot: usize, size: usize) -> Self {
        SlotAllocator {
            bits: bitvec![u8, Lsb0; 0; size].into_boxed_bitslice(),
            used: 0,
            base_slot: first_slot,
        }
    }

    pub fn base_slot(&self) -> usize { self.base_slot }
    pub fn used_slots(&self) -> usize { self.used }
    pub fn free_slots(&self) -> usize { self.bits.len() - self.used }

    fn not_any_in_range(&self, range: Range<usize>) -> bool {
        if range.start < self.bits.len() && range.end <= self.bits.len() {
            self.bits[range].not_any()
        } else {
            false
        }
    }

    fn set_range(&mut self, range: Range<usize>, value: bool) {
        let count = range.len();
        let bslice = &mut self.bits.as_mut_bitslice()[range];
        if value {
            assert!(bslice.not_any());
            bslice.fill(true);
            self.used += count;
        } else {
            assert!(bslice.all());
            bslice.fill(false);
            self.used -= count;
        }
    }

    /// Allocates `count` consecutive slots, returning the first.
    pub fn alloc(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free_slots() {
            return None;
        }
        let first = if count == 1 {
            let bit = self.bits.first_zero()?;
            self.bits.set(bit, true);
            self.used += 1;
            bit
        } else {
            let first = self
                .bits
                .iter_zeros()
                .find(|bit| self.not_any_in_range(bit + 1..bit + count))?;
            self.set_range(first..first + count, true);
            first
        };
        #[cfg(feature = "TRACE_OPS")]
        trace!("slot alloc {}..{}", first, first + count);
        Some(first + self.base_slot)
    }

    pub fn free(&mut self, first_slot: usize, count: usize) {
        assert!(first_slot >= self.base_slot);
        assert!(count <= self.used, "count {} > used {}", count, self.used);
        #[cfg(feature = "TRACE_OPS")]
        trace!("slot free {} count {}", first_slot, count);
        let first = first_slot - self.base_slot;
        self.set_range(first..first + count, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NSLOTS: usize = 64;
    const BASE: usize = 10;

    #[test]
    fn test_alloc_free_one() {
        let mut slots = SlotAllocator::new(BASE, NSLOTS);
        let first = slots.alloc(1).unwrap();
        assert!(first >= BASE);
        assert_eq!(slots.used_slots(), 1);
        slots.free(first, 1);
        assert_eq!(slots.used_slots(), 0);
        // First-fit: same slot comes back.
        assert_eq!(slots.alloc(1).unwrap(), first);
    }

    #[test]
    fn test_alloc_range_after_hole() {
        let mut slots = SlotAllocator::new(BASE, NSLOTS);
        let first = slots.alloc(4).unwrap();
        // Free the first 2 slots to create a hole.
        slots.free(first, 2);
        // The hole is 2-large so a 4-request lands after the block.
        let second = slots.alloc(4).unwrap();
        assert_eq!(second, first + 4);
        slots.free(first + 2, 2);
        slots.free(second, 4);
        assert_eq!(slots.used_slots(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut slots = SlotAllocator::new(0, 4);
        let first = slots.alloc(3).unwrap();
        assert!(slots.alloc(2).is_none());
        slots.free(first, 2);
        // Free slots exist but not contiguously.
        assert!(slots.alloc(3).is_none());
    }

    #[test]
    #[should_panic]
    fn test_double_free() {
        let mut slots = SlotAllocator::new(0, NSLOTS);
        let first = slots.alloc(1).unwrap();
        slots.free(first, 1);
        slots.free(first, 1);
    }
}

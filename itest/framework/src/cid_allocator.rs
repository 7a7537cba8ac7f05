// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small allocator for guest vsock context IDs.

use std::{
    ops::Range,
    sync::atomic::{AtomicU32, Ordering},
};

use thiserror::Error;

/// CIDs 0 through 2 are reserved (hypervisor, local, and host).
pub const FIRST_GUEST_CID: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidAllocatorError {
    #[error("no more guest CIDs available")]
    NoMoreCids,
}

pub struct GuestCidAllocator {
    range: Range<u32>,

    /// Tests run in a `catch_unwind` block, so state created outside a test
    /// case must be unwind-safe. Handing out the next CID atomically keeps the
    /// allocator usable there.
    next: AtomicU32,
}

impl GuestCidAllocator {
    /// Creates an allocator over `range`, clamped so it never hands out a
    /// reserved CID.
    pub fn new(range: Range<u32>) -> Self {
        let start = range.start.max(FIRST_GUEST_CID);
        let range = start..range.end.max(start);
        Self { range, next: AtomicU32::new(start) }
    }

    pub fn next(&self) -> Result<u32, CidAllocatorError> {
        if self.next.load(Ordering::Relaxed) >= self.range.end {
            return Err(CidAllocatorError::NoMoreCids);
        }

        let cid = self.next.fetch_add(1, Ordering::Relaxed);
        if cid >= self.range.end {
            Err(CidAllocatorError::NoMoreCids)
        } else {
            Ok(cid)
        }
    }

    pub fn reset(&self) {
        self.next.store(self.range.start, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_reserved_cids() {
        let alloc = GuestCidAllocator::new(0..5);
        assert_eq!(alloc.next(), Ok(3));
        assert_eq!(alloc.next(), Ok(4));
        assert_eq!(alloc.next(), Err(CidAllocatorError::NoMoreCids));
        assert_eq!(alloc.next(), Err(CidAllocatorError::NoMoreCids));
    }

    #[test]
    fn reset_starts_over() {
        let alloc = GuestCidAllocator::new(10..12);
        assert_eq!(alloc.next(), Ok(10));
        assert_eq!(alloc.next(), Ok(11));
        alloc.reset();
        assert_eq!(alloc.next(), Ok(10));
    }

    #[test]
    fn fully_reserved_range_is_empty() {
        let alloc = GuestCidAllocator::new(0..3);
        assert_eq!(alloc.next(), Err(CidAllocatorError::NoMoreCids));
    }
}

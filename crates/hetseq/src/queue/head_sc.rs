//! Single-consumer head: plain cursor advancement, no pinning.
//!
//! With one consumer, nobody else ever advances the head or reclaims pages,
//! so the scan needs no pin protocol: the cursor is advanced with relaxed
//! stores and pages are released directly when the cursor crosses their
//! end-of-page sentinel.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::invariants::{debug_assert_claimable, debug_assert_claimed};
use crate::page_alloc::PagedAllocator;
use crate::queue::layout::{
    first_block, header_of, page_of, release_external, ControlBlock, ADDR_MASK, BUSY, DEAD,
    END_OF_PAGE, EXTERNAL, PAGE_RETIRED,
};
use crate::queue::{Claim, Head};

/// Head state for the single-consumer configurations.
///
/// Atomic only so the queue stays `Sync`; the unique
/// [`Consumer`](crate::queue::Consumer) handle guarantees a single writer.
#[derive(Default)]
pub struct ScHead {
    head: AtomicUsize,
}

impl<A: PagedAllocator> Head<A> for ScHead {
    const SINGLE: bool = true;

    fn try_start_consume(&self, alloc: &A, entry: &AtomicUsize, skip_busy: bool) -> Option<Claim> {
        let mut h = self.head.load(Ordering::Relaxed);
        if h == 0 {
            h = entry.load(Ordering::Acquire);
            if h == 0 {
                return None;
            }
            self.head.store(h, Ordering::Relaxed);
        }

        let mut pos = h;
        loop {
            let word = unsafe { (*(pos as *const ControlBlock)).next.load(Ordering::Acquire) };
            if word == 0 {
                // Frontier: nothing has been linked here yet.
                return None;
            }

            if word & END_OF_PAGE != 0 {
                let next_page =
                    unsafe { (*header_of::<A>(pos)).next_page.load(Ordering::Acquire) };
                debug_assert!(next_page != 0);
                let first = first_block::<A>(next_page);
                if self.head.load(Ordering::Relaxed) == pos {
                    // Every block before the sentinel is DEAD: the page is
                    // done. No pins in the single-consumer configuration, so
                    // release it directly.
                    self.head.store(first, Ordering::Relaxed);
                    let page = page_of::<A>(pos);
                    let prev = unsafe {
                        (*header_of::<A>(pos))
                            .pins
                            .fetch_or(PAGE_RETIRED, Ordering::AcqRel)
                    };
                    if prev == 0 {
                        unsafe {
                            alloc.deallocate_page(std::ptr::NonNull::new_unchecked(
                                page as *mut u8,
                            ));
                        }
                    }
                }
                pos = first;
                continue;
            }

            let addr = word & ADDR_MASK;
            if word & DEAD != 0 {
                if self.head.load(Ordering::Relaxed) == pos {
                    // Advance past the dead prefix, reclaiming external
                    // blocks as the head passes them.
                    if word & EXTERNAL != 0 {
                        unsafe { release_external(alloc, pos) };
                    }
                    self.head.store(addr, Ordering::Relaxed);
                }
                pos = addr;
                continue;
            }

            if word & BUSY != 0 {
                if skip_busy {
                    pos = addr;
                    continue;
                }
                // Sequential consistency: the slot is reserved and will
                // become READY or DEAD; do not pass it.
                return None;
            }

            // READY: claim it. Single consumer, so a plain store suffices —
            // producers stopped touching this word when they cleared BUSY.
            debug_assert_claimable!(word);
            unsafe {
                (*(pos as *const ControlBlock))
                    .next
                    .store(word | BUSY, Ordering::Relaxed);
            }
            return Some(Claim {
                block: pos,
                word,
                pinned: 0,
            });
        }
    }

    fn commit_consume(&self, _alloc: &A, claim: &Claim) {
        // CLAIMED -> DEAD. The next scan advances the head past it.
        unsafe {
            let cur = (*(claim.block as *const ControlBlock))
                .next
                .load(Ordering::Relaxed);
            debug_assert_claimed!(cur);
            (*(claim.block as *const ControlBlock))
                .next
                .store((claim.word & !BUSY) | DEAD, Ordering::Release);
        }
    }

    fn cancel_consume(&self, _alloc: &A, claim: &Claim) {
        // CLAIMED -> READY: the element is consumable again.
        unsafe {
            (*(claim.block as *const ControlBlock))
                .next
                .store(claim.word, Ordering::Release);
        }
    }

    fn position(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }
}
